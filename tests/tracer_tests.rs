//! End-to-end tests for traced calls

use std::sync::Arc;

use agent_trace::{
    flush_active_events, track_message, track_state, traces_to_value, EventScope, EventStore,
    ExecutionContext, FixSuggestion, IoRole, ManageEvent, Message, Origin, TraceError, TracedArgs,
    TracedSystem, Tracer, TracerConfig,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use serial_test::serial;

struct Agent {
    name: String,
    instance: String,
}

impl Agent {
    fn new(instance: &str) -> Self {
        Self {
            name: "qa-agent".to_string(),
            instance: instance.to_string(),
        }
    }
}

impl TracedSystem for Agent {
    fn system_name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn system_instance_id(&self) -> Option<&str> {
        Some(&self.instance)
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn lm_call(store: &Arc<EventStore>) -> Tracer {
    Tracer::new(Origin::Agent, "lm_call")
        .manage_event(ManageEvent::Create)
        .increment_partition(true)
        .with_store(Arc::clone(store))
}

fn ask(tracer: &Tracer, agent: &Agent, question: &str) -> Result<String, TraceError> {
    tracer.call(agent, TracedArgs::new(), || {
        track_message(
            vec![Message::user(question)],
            "gpt-4o-mini",
            false,
            Origin::Agent,
            IoRole::Input,
        );
        let answer = "Paris".to_string();
        track_message(
            vec![Message::assistant(answer.clone())],
            "gpt-4o-mini",
            false,
            Origin::Agent,
            IoRole::Output,
        );
        Ok(answer)
    })
}

#[test]
fn test_lm_calls_land_in_increasing_partitions() {
    init_tracing();
    let store = Arc::new(EventStore::new());
    let tracer = lm_call(&store);
    let agent = Agent::new("lm-1");

    assert_eq!(ask(&tracer, &agent, "Capital of France?").unwrap(), "Paris");
    assert_eq!(ask(&tracer, &agent, "Capital of France, again?").unwrap(), "Paris");

    let trace = store.get_system_trace("lm-1").unwrap();
    assert_eq!(trace.system_name, "qa-agent");
    assert_eq!(trace.current_partition_index, 2);
    let indices: Vec<u64> = trace.partition.iter().map(|p| p.partition_index).collect();
    assert_eq!(indices, vec![1, 2]);

    for partition in &trace.partition {
        assert_eq!(partition.events.len(), 1);
        let event = &partition.events[0];
        assert_eq!(event.event_type, "lm_call");
        assert!(event.closed.unwrap() >= event.opened);
        assert!(event.environment_compute_steps.is_empty());

        let step = event.agent_compute_step.as_ref().unwrap();
        assert_eq!(step.model_name(), Some("gpt-4o-mini"));
        let inputs: Vec<_> = step.message_inputs().collect();
        let outputs: Vec<_> = step.message_outputs().collect();
        assert_eq!(inputs.len(), 1);
        assert_eq!(outputs.len(), 1);
        assert_eq!(inputs[0].messages[0].role, "user");
        assert_eq!(outputs[0].messages[0], Message::assistant("Paris"));
    }

    // Nothing leaks into the thread's context
    let ctx = ExecutionContext::current();
    assert!(ctx.identity().is_none());
    assert!(ctx.active_event_types().is_empty());
}

#[test]
fn test_environment_step_records_arbitrary_io() {
    let store = Arc::new(EventStore::new());
    let env = Tracer::new(Origin::Environment, "environment_processing")
        .manage_event(ManageEvent::Create)
        .with_store(Arc::clone(&store));
    let agent = Agent::new("env-1");

    let out: Result<Value, TraceError> =
        env.call(&agent, TracedArgs::new().arg("input_data", "X"), || {
            Ok(json!({"processed": "X", "timestamp": 1700000000.5}))
        });
    assert_eq!(out.unwrap()["processed"], "X");

    let trace = store.get_system_trace("env-1").unwrap();
    let event = trace.events().next().unwrap();
    assert!(event.agent_compute_step.is_none());
    assert_eq!(event.environment_compute_steps.len(), 1);

    let step = &event.environment_compute_steps[0];
    assert_eq!(step.event_order, 1);
    let input = step.arbitrary_inputs().next().unwrap();
    assert_eq!(input.get("input_data"), Some(&json!("X")));
    let output = step.arbitrary_outputs().next().unwrap();
    assert_eq!(
        output.get("result"),
        Some(&json!({"processed": "X", "timestamp": 1700000000.5}))
    );
}

#[test]
fn test_tuple_results_are_recorded_element_wise() {
    let store = Arc::new(EventStore::new());
    let env = Tracer::new(Origin::Environment, "env_step")
        .manage_event(ManageEvent::Create)
        .with_store(Arc::clone(&store));

    let out: Result<(String, f64, bool), TraceError> =
        env.call(&Agent::new("tuple-1"), TracedArgs::new(), || {
            Ok(("obs".to_string(), 0.5, false))
        });
    assert!(out.is_ok());

    let trace = store.get_system_trace("tuple-1").unwrap();
    let step = &trace.events().next().unwrap().environment_compute_steps[0];
    let names: Vec<&str> = step
        .arbitrary_outputs()
        .flat_map(|o| o.outputs.keys().map(String::as_str))
        .collect();
    assert_eq!(names, vec!["result_0", "result_1", "result_2"]);
}

#[test]
fn test_failing_computation_still_delivers_closed_event() {
    let store = Arc::new(EventStore::new());
    let tracer = lm_call(&store);

    let outcome: Result<String, anyhow::Error> =
        tracer.call(&Agent::new("err-1"), TracedArgs::new(), || {
            track_state("prompt", "hello", Origin::Agent, IoRole::Input, None);
            Err(anyhow::anyhow!("provider timed out"))
        });

    assert_eq!(outcome.unwrap_err().to_string(), "provider timed out");
    let trace = store.get_system_trace("err-1").unwrap();
    assert_eq!(trace.event_count(), 1);
    let event = trace.events().next().unwrap();
    assert!(event.closed.unwrap() >= event.opened);
    assert!(ExecutionContext::current().active_event_types().is_empty());
}

#[test]
fn test_missing_identity_is_reported_before_running() {
    struct Anonymous;

    impl TracedSystem for Anonymous {
        fn system_name(&self) -> Option<&str> {
            Some("anon")
        }

        fn system_instance_id(&self) -> Option<&str> {
            None
        }
    }

    let store = Arc::new(EventStore::new());
    let err = lm_call(&store)
        .call(&Anonymous, TracedArgs::new(), || Ok::<_, TraceError>(()))
        .unwrap_err();
    assert!(err.is_configuration());
    assert!(err.fix_suggestion().is_some());
    assert!(store.is_empty());
}

#[test]
fn test_scoped_event_collects_steps_and_closes() {
    let store = Arc::new(EventStore::new());
    let agent = Agent::new("scope-1");
    let step = Tracer::new(Origin::Environment, "episode").with_store(Arc::clone(&store));

    {
        let _episode = EventScope::open_for(&agent, "episode", Arc::clone(&store)).unwrap();
        for turn in 0..3 {
            let out: Result<u32, TraceError> =
                step.call(&agent, TracedArgs::new().arg("turn", &turn), || Ok(turn * 10));
            assert_eq!(out.unwrap(), turn * 10);
        }
        assert!(store.is_empty());
    }

    let trace = store.get_system_trace("scope-1").unwrap();
    assert_eq!(trace.event_count(), 1);
    let event = trace.events().next().unwrap();
    assert!(event.is_closed());
    let orders: Vec<u32> = event
        .environment_compute_steps
        .iter()
        .map(|s| s.event_order)
        .collect();
    assert_eq!(orders, vec![1, 2, 3]);
}

#[test]
fn test_end_closes_event_opened_elsewhere() {
    let store = Arc::new(EventStore::new());
    let agent = Agent::new("end-1");
    let scope = EventScope::open_for(&agent, "episode", Arc::clone(&store)).unwrap();
    let handle = scope.handle().unwrap().clone();

    let finish = Tracer::new(Origin::Agent, "episode")
        .manage_event(ManageEvent::End)
        .with_store(Arc::clone(&store));
    let out: Result<&str, TraceError> = finish.call(&agent, TracedArgs::new(), || Ok("done"));
    assert_eq!(out.unwrap(), "done");
    assert!(!handle.is_open());
    assert_eq!(store.get_system_trace("end-1").unwrap().event_count(), 1);

    // The scope no longer owns an open event
    drop(scope);
    assert_eq!(store.get_system_trace("end-1").unwrap().event_count(), 1);
}

#[test]
fn test_flush_delivers_events_left_open() {
    let store = Arc::new(EventStore::new());
    let agent = Agent::new("flush-1");
    let scope = EventScope::open_for(&agent, "episode", Arc::clone(&store)).unwrap();

    assert_eq!(flush_active_events(&store), 1);
    assert_eq!(store.get_system_trace("flush-1").unwrap().event_count(), 1);
    drop(scope);
    assert_eq!(store.get_system_trace("flush-1").unwrap().event_count(), 1);
}

#[test]
fn test_finetune_default_applies_to_tracked_messages() {
    let store = Arc::new(EventStore::new());
    let tracer = lm_call(&store).finetune_step(true).log_result(true);
    ask(&tracer, &Agent::new("ft-1"), "hi").unwrap();

    let trace = store.get_system_trace("ft-1").unwrap();
    let step = trace.events().next().unwrap().agent_compute_step.clone().unwrap();
    let details = step
        .arbitrary_inputs()
        .find(|a| a.inputs.contains_key("finetune"))
        .unwrap();
    assert_eq!(details.get("finetune"), Some(&json!(true)));
}

#[test]
fn test_tracer_from_yaml_config() {
    let config = TracerConfig::from_yaml(
        r#"
origin: agent
event_type: lm_call
manage_event: create
increment_partition: true
log_result: true
name: answer_question
"#,
    )
    .unwrap();

    let store = Arc::new(EventStore::new());
    let tracer = Tracer::from_config(config).with_store(Arc::clone(&store));
    ask(&tracer, &Agent::new("yaml-1"), "hi").unwrap();
    assert_eq!(
        store.get_system_trace("yaml-1").unwrap().current_partition_index,
        1
    );
}

#[test]
fn test_export_is_repeatable() {
    let store = Arc::new(EventStore::new());
    let tracer = lm_call(&store);
    ask(&tracer, &Agent::new("export-1"), "hi").unwrap();

    let traces = store.get_system_traces();
    let first = traces_to_value(&traces);
    let second = traces_to_value(&traces);
    assert_eq!(first, second);
    assert_eq!(traces, store.get_system_traces());

    let event = &first[0]["partition"][0]["events"][0];
    assert_eq!(event["event_type"], "lm_call");
    assert_eq!(
        event["agent_compute_steps"][0]["compute_input"][0]["messages"][0]["role"],
        "user"
    );
}

#[test]
#[serial]
fn test_default_tracer_uses_global_store() {
    let global = EventStore::global();
    global.reset();

    let tracer = Tracer::new(Origin::Agent, "lm_call").manage_event(ManageEvent::Create);
    ask(&tracer, &Agent::new("global-1"), "hi").unwrap();

    let traces = global.get_system_traces();
    assert_eq!(traces.len(), 1);
    assert_eq!(traces[0].partition[0].partition_index, 0);
    global.reset();
}

fn without_timestamps(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for key in ["opened", "closed", "compute_began", "compute_ended"] {
                map.remove(key);
            }
            map.values_mut().for_each(without_timestamps);
        }
        Value::Array(items) => items.iter_mut().for_each(without_timestamps),
        _ => {}
    }
}

fn exported(store: &EventStore) -> Value {
    let mut value = traces_to_value(&store.get_system_traces());
    without_timestamps(&mut value);
    value
}

fn nested_tracers(store: &Arc<EventStore>) -> (Tracer, Tracer) {
    let outer = Tracer::new(Origin::Agent, "lm_call")
        .manage_event(ManageEvent::Create)
        .with_store(Arc::clone(store));
    let inner = Tracer::new(Origin::Environment, "env_step")
        .manage_event(ManageEvent::Create)
        .with_store(Arc::clone(store));
    (outer, inner)
}

fn ask_model(question: &str) {
    track_message(
        vec![Message::user(question)],
        "gpt-4o-mini",
        false,
        Origin::Agent,
        IoRole::Input,
    );
}

fn model_replies(answer: &str) {
    track_message(
        vec![Message::assistant(answer)],
        "gpt-4o-mini",
        false,
        Origin::Agent,
        IoRole::Output,
    );
}

fn explore(outer: &Tracer, inner: &Tracer, agent: &Agent) -> Result<String, TraceError> {
    outer.call(agent, TracedArgs::new().arg("question", "Q"), || -> Result<_, TraceError> {
        ask_model("Q");
        let observation = inner.call(agent, TracedArgs::new().arg("action", "look"), || {
            Ok::<_, TraceError>("room")
        })?;
        model_replies(observation);
        Ok(observation.to_string())
    })
}

#[test]
fn test_nested_sync_call_keeps_outer_inputs() {
    let store = Arc::new(EventStore::new());
    let (outer, inner) = nested_tracers(&store);
    let agent = Agent::new("nested-1");

    assert_eq!(explore(&outer, &inner, &agent).unwrap(), "room");

    let trace = store.get_system_trace("nested-1").unwrap();
    let types: Vec<&str> = trace.events().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, vec!["env_step", "lm_call"]);

    let outer_event = trace.events().find(|e| e.event_type == "lm_call").unwrap();
    let step = outer_event.agent_compute_step.as_ref().unwrap();
    let declared: Vec<&str> = step
        .arbitrary_inputs()
        .flat_map(|a| a.inputs.keys().map(String::as_str))
        .collect();
    assert!(declared.contains(&"question"), "inputs: {declared:?}");
    assert_eq!(step.message_inputs().count(), 1);
    assert_eq!(step.message_outputs().count(), 1);

    let inner_event = trace.events().find(|e| e.event_type == "env_step").unwrap();
    let inner_step = &inner_event.environment_compute_steps[0];
    assert_eq!(
        inner_step.arbitrary_inputs().next().unwrap().get("action"),
        Some(&json!("look"))
    );
    assert!(inner_event.agent_compute_step.is_none());
    assert!(ExecutionContext::current().identity().is_none());
}

#[tokio::test]
async fn test_nested_calls_export_the_same_on_both_backends() {
    let agent = Agent::new("nested-2");

    let sync_store = Arc::new(EventStore::new());
    let (outer, inner) = nested_tracers(&sync_store);
    assert_eq!(explore(&outer, &inner, &agent).unwrap(), "room");

    let async_store = Arc::new(EventStore::new());
    let (outer, inner) = nested_tracers(&async_store);
    let out: Result<String, TraceError> = outer
        .call_async(&agent, TracedArgs::new().arg("question", "Q"), || async {
            ask_model("Q");
            let observed = inner
                .call_async(&agent, TracedArgs::new().arg("action", "look"), || async {
                    Ok::<_, TraceError>("room")
                })
                .await;
            let observation = match observed {
                Ok(observation) => observation,
                Err(err) => return Err(err),
            };
            model_replies(observation);
            Ok::<_, TraceError>(observation.to_string())
        })
        .await;
    assert_eq!(out.unwrap(), "room");

    assert_eq!(exported(&sync_store), exported(&async_store));
}
