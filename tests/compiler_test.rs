use mofflow::compiler::core::Compiler;
use mofflow::dsl::builder::FlowBuilder;
use mofflow::dsl::{Flow, Input, Job};
use mofflow::error::FlowError;
use serde_json::json;

#[test]
fn test_compile_flattens_in_declaration_order() {
    let a = Job::new("a", "const");
    let b = Job::new("b", "const").with_input("x", a.output());
    let c = Job::new("c", "const").with_input("x", b.output());
    let inner = FlowBuilder::new("inner").job(b).output_last().build();
    let flow = FlowBuilder::new("outer")
        .metadata("mof_id", "ZIF-8")
        .job(a)
        .flow(inner)
        .job(c)
        .output_last()
        .build();
    let flow_id = flow.id;

    let blueprint = Compiler::new().compile(flow).expect("Compilation failed");

    assert_eq!(blueprint.id, flow_id);
    assert_eq!(blueprint.name, "outer");
    assert_eq!(blueprint.metadata["mof_id"], json!("ZIF-8"));
    let names: Vec<&str> = blueprint.jobs.iter().map(|j| j.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "c"]);

    // back to a flow without losing ids
    let rebuilt = blueprint.clone().into_flow();
    assert_eq!(rebuilt.job_ids(), blueprint.jobs.iter().map(|j| j.id).collect::<Vec<_>>());
}

#[test]
fn test_duplicate_ids_are_rejected() {
    let a = Job::new("a", "const");
    let copy = a.clone();
    let dup_id = a.id;
    let flow = FlowBuilder::new("dup").job(a).job(copy).build();

    match Compiler::new().compile(flow) {
        Err(FlowError::DuplicateJob(id)) => assert_eq!(id, dup_id),
        other => panic!("expected DuplicateJob, got {:?}", other),
    }
}

#[test]
fn test_known_ids_cannot_be_reused_but_can_be_referenced() {
    let existing = Job::new("existing", "const");
    let consumer = Job::new("consumer", "const").with_input("x", existing.output());

    let ok = FlowBuilder::new("refs existing").job(consumer).build();
    assert!(Compiler::with_known([existing.id]).compile(ok).is_ok());

    let reused = FlowBuilder::new("reuses existing").job(existing.clone()).build();
    assert!(matches!(
        Compiler::with_known([existing.id]).compile(reused),
        Err(FlowError::DuplicateJob(_))
    ));
}

#[test]
fn test_dangling_reference() {
    let ghost = Job::new("ghost", "const");
    let consumer = Job::new("consumer", "const").with_input("x", ghost.output());
    let consumer_id = consumer.id;
    let flow = FlowBuilder::new("dangling").job(consumer).build();

    match Compiler::new().compile(flow) {
        Err(FlowError::DanglingReference { job, name, target }) => {
            assert_eq!(job, consumer_id);
            assert_eq!(name, "consumer");
            assert_eq!(target, ghost.id);
        }
        other => panic!("expected DanglingReference, got {:?}", other),
    }
}

#[test]
fn test_empty_flow() {
    let flow = Flow::new("nothing", Vec::new(), None);
    assert!(matches!(Compiler::new().compile(flow), Err(FlowError::EmptyFlow(_))));

    // a flow holding only a concrete output is fine
    let constant = Flow::new("constant", Vec::new(), Some(Input::Value(json!(42))));
    assert!(Compiler::new().compile(constant).is_ok());

    let nested_empty = FlowBuilder::new("outer")
        .job(Job::new("a", "const"))
        .flow(Flow::new("hollow", Vec::new(), None))
        .build();
    assert!(matches!(
        Compiler::new().compile(nested_empty),
        Err(FlowError::EmptyFlow(ref name)) if name == "hollow"
    ));
}

#[test]
fn test_unreachable_output() {
    let outsider = Job::new("outsider", "const");
    let flow = FlowBuilder::new("unreachable")
        .job(Job::new("member", "const"))
        .output(outsider.output())
        .build();

    match Compiler::new().compile(flow) {
        Err(FlowError::UnreachableOutput { flow, target }) => {
            assert_eq!(flow, "unreachable");
            assert_eq!(target, outsider.id);
        }
        other => panic!("expected UnreachableOutput, got {:?}", other),
    }
}

#[test]
fn test_cycle() {
    let mut a = Job::new("a", "const");
    let b = Job::new("b", "const").with_input("x", a.output());
    a = a.with_input("y", b.output());
    let flow = FlowBuilder::new("cycle").job(a).job(b).build();

    assert!(matches!(Compiler::new().compile(flow), Err(FlowError::Cycle(_))));

    let mut selfish = Job::new("selfish", "const");
    selfish = selfish.clone().with_input("me", selfish.output());
    let flow = FlowBuilder::new("self").job(selfish).build();
    assert!(matches!(Compiler::new().compile(flow), Err(FlowError::Cycle(_))));
}
