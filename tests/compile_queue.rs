//! Compiled queue shape: steps, sequence numbers, parallel links, loop jumps.

use flowl::driver::native;
use flowl::parser::parse;
use flowl::runtime::{RunNode, compile};

fn register_noop(name: &str) {
    native::register(name, |_cancel, _args| async { Ok(Default::default()) });
}

/// Scenario: a parallel group between serial steps, with fn-configured and
/// inline arguments.
#[test]
fn parallel_group_and_serial_tail() {
    for name in ["function1", "function2"] {
        register_noop(name);
    }

    let src = r#"
load "go:function1"
load "go:function2"
load "shell:/tmp/function3"
load "shell:/tmp/function4"
load "shell:/tmp/function5"

fn f1 = function1 { args = { "k": "v1" "hello": "world" } }

co f1
co function2 { "k" : "v2" }
co function3
co { function4 function5 }
co function3 { "k": "v3" }
"#;
    let ast = parse(src).unwrap();
    let queue = compile(&ast).unwrap();

    let tasks: Vec<_> = queue.tasks().collect();
    assert_eq!(tasks.len(), 6);
    assert_eq!(
        tasks.iter().map(|t| t.step).collect::<Vec<_>>(),
        vec![1, 2, 3, 4, 4, 5]
    );

    // Sequence numbers are unique across the queue.
    let mut seqs: Vec<_> = tasks.iter().map(|t| t.seq).collect();
    seqs.sort_unstable();
    seqs.dedup();
    assert_eq!(seqs.len(), 6);

    // Step 4 is a parallel pair linked through sibling pointers.
    assert_eq!(tasks[3].fname, "function4");
    assert_eq!(tasks[4].fname, "function5");
    assert!(tasks[3].parallel.is_some());
    assert!(tasks[4].parallel.is_none());
    assert_eq!(tasks[3].step, tasks[4].step);
    assert_ne!(tasks[3].seq, tasks[4].seq);

    // fn args bind to the configured task.
    let f1 = &tasks[0];
    assert_eq!(f1.name, "f1");
    assert_eq!(f1.fname, "function1");
    let f1_args: Vec<_> = f1
        .args
        .iter()
        .map(|a| (a.key.as_str(), a.value.text.as_str()))
        .collect();
    assert_eq!(f1_args, vec![("k", "v1"), ("hello", "world")]);

    // The second function3 call carries its own inline args.
    let last = &tasks[5];
    assert_eq!(last.fname, "function3");
    assert_eq!(last.args.len(), 1);
    assert_eq!(last.args[0].key, "k");
    assert_eq!(last.args[0].value.text, "v3");
}

/// Scenario: a for loop with return capture compiles to ForEnter, three
/// tasks, and a matching ForBack.
#[test]
fn for_loop_emits_symmetric_jumps() {
    for name in ["print", "sleep", "time"] {
        register_noop(name);
    }

    let src = r#"
load "go:print" load "go:sleep" load "go:time"
var t
for { co time -> t
      co print { "Time": "$(t.Now)" }
      co sleep }
"#;
    let ast = parse(src).unwrap();
    let queue = compile(&ast).unwrap();

    assert_eq!(queue.nodes.len(), 5);
    let RunNode::ForEnter(enter) = &queue.nodes[0] else {
        panic!("node 0 must be a ForEnter");
    };
    assert_eq!(enter.back_index, 4);
    let RunNode::ForBack(back) = &queue.nodes[4] else {
        panic!("node 4 must be a ForBack");
    };
    assert_eq!(back.enter_index, 0);

    let tasks: Vec<_> = queue.tasks().collect();
    assert_eq!(
        tasks.iter().map(|t| t.fname.as_str()).collect::<Vec<_>>(),
        vec!["time", "print", "sleep"]
    );
    assert_eq!(
        tasks.iter().map(|t| t.step).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(tasks[0].return_var.as_deref(), Some("t"));
}

/// Jump symmetry holds for nested loops too.
#[test]
fn nested_for_loops_pair_correctly() {
    register_noop("inner_work");
    let src = r#"
load "go:inner_work"
var i = 0
for $(i) < 1 {
    for $(i) < 1 {
        co inner_work
    }
    i <- $(i) + 1
}
"#;
    let ast = parse(src).unwrap();
    let queue = compile(&ast).unwrap();

    for (index, node) in queue.nodes.iter().enumerate() {
        if let RunNode::ForEnter(enter) = node {
            let RunNode::ForBack(back) = &queue.nodes[enter.back_index] else {
                panic!("ForEnter at {index} must point at a ForBack");
            };
            assert_eq!(back.enter_index, index);
        }
    }
}

/// Directives compile to tasks on the built-in driver.
#[test]
fn directives_become_builtin_tasks() {
    let src = "var greeting = \"hi\"\nprintln \"$(greeting)\"\nsleep \"1ms\"\n";
    let ast = parse(src).unwrap();
    let queue = compile(&ast).unwrap();

    let tasks: Vec<_> = queue.tasks().collect();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].fname, "println");
    assert_eq!(tasks[0].driver.name(), "builtin");
    assert_eq!(tasks[1].fname, "sleep");
    assert_eq!(tasks[1].args[0].key, "duration");
}

/// The synchronous execute entry drives jumps and loop rewrites, handing
/// one batch per step to the callback.
#[test]
fn execute_callback_sees_loop_iterations() {
    register_noop("walked_fn");
    let src = r#"
load "go:walked_fn"
var i = 0
for $(i) < 3 {
    co walked_fn
    i <- $(i) + 1
}
"#;
    let ast = parse(src).unwrap();
    let queue = compile(&ast).unwrap();

    let mut batches = Vec::new();
    queue
        .execute(&ast, |batch| {
            batches.push(batch.iter().map(|t| t.fname.clone()).collect::<Vec<_>>());
            Ok(())
        })
        .unwrap();
    assert_eq!(batches.len(), 3);
    assert!(batches.iter().all(|b| b == &vec!["walked_fn".to_string()]));
}

/// An unloaded function is rejected at compile time.
#[test]
fn unloaded_function_is_rejected() {
    let src = "co never_loaded_fn\n";
    let ast = parse(src).unwrap();
    let err = compile(&ast).unwrap_err();
    assert!(err.to_string().contains("never_loaded_fn"));
}

/// Loading the same function name twice is rejected.
#[test]
fn duplicate_load_is_rejected() {
    register_noop("dup_fn");
    let src = "load \"go:dup_fn\"\nload \"shell:/tmp/dup_fn\"\nco dup_fn\n";
    let ast = parse(src).unwrap();
    let err = compile(&ast).unwrap_err();
    assert!(err.to_string().contains("dup_fn"));
}
