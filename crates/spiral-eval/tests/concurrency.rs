//! Async-evaluator scenarios: spawn/await, par, channels through documents,
//! select/race, timeouts, effect logging, and scheduler budgets.

use std::rc::Rc;

use spiral_core::core_ops;
use spiral_core::document::{Document, CAP_ASYNC};
use spiral_core::env::DefRegistry;
use spiral_core::error::ErrorCode;
use spiral_core::expr::{Arg, Expr};
use spiral_core::node::Node;
use spiral_core::types::SpiralType;
use spiral_core::value::Value;
use spiral_eval::{AsyncEvaluator, ScheduleMode};

fn async_evaluator() -> AsyncEvaluator {
    AsyncEvaluator::new(Rc::new(core_ops::registry()), Rc::new(DefRegistry::new()))
}

fn eval(doc: &Document) -> Value {
    async_evaluator().evaluate_program(doc).unwrap()
}

fn async_doc(nodes: Vec<Node>, result: &str) -> Document {
    Document::new("1.0.0", nodes, result).with_capability(CAP_ASYNC)
}

#[test]
fn spawn_and_await_returns_the_task_value() {
    let doc = async_doc(
        vec![
            Node::expr("work", Expr::int_lit(10)),
            Node::expr("s", Expr::Spawn { task: "work".into() }),
            Node::expr(
                "r",
                Expr::Await {
                    future: Arg::node("s"),
                    timeout: None,
                    fallback: None,
                    return_index: false,
                },
            ),
        ],
        "r",
    );
    assert_eq!(eval(&doc), Value::Int(10));
}

#[test]
fn par_collects_branch_results_in_order() {
    let doc = async_doc(
        vec![
            Node::expr("a", Expr::int_lit(1)),
            Node::expr("b", Expr::int_lit(2)),
            Node::expr("c", Expr::int_lit(3)),
            Node::expr(
                "r",
                Expr::Par {
                    branches: vec!["a".into(), "b".into(), "c".into()],
                },
            ),
        ],
        "r",
    );
    assert_eq!(
        eval(&doc),
        Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
    );
}

#[test]
fn rendezvous_channel_pairs_send_and_recv() {
    // Capacity-0 channel: concurrent send(42) and recv complete together.
    let doc = async_doc(
        vec![
            Node::expr(
                "ch",
                Expr::Channel {
                    channel_type: SpiralType::Int,
                    buffer_size: None,
                },
            ),
            Node::expr(
                "sender",
                Expr::Send {
                    channel: Arg::node("ch"),
                    value: Arg::inline(Expr::int_lit(42)),
                },
            ),
            Node::expr(
                "receiver",
                Expr::Recv {
                    channel: Arg::node("ch"),
                },
            ),
            Node::expr(
                "r",
                Expr::Par {
                    branches: vec!["sender".into(), "receiver".into()],
                },
            ),
        ],
        "r",
    );
    assert_eq!(eval(&doc), Value::List(vec![Value::Void, Value::Int(42)]));
}

#[test]
fn buffered_channel_is_fifo_across_tasks() {
    let doc = async_doc(
        vec![
            Node::expr(
                "ch",
                Expr::Channel {
                    channel_type: SpiralType::Int,
                    buffer_size: Some(3),
                },
            ),
            Node::expr(
                "sender",
                Expr::Seq {
                    first: Arg::inline(Expr::Send {
                        channel: Arg::node("ch"),
                        value: Arg::inline(Expr::int_lit(1)),
                    }),
                    then: Arg::inline(Expr::Seq {
                        first: Arg::inline(Expr::Send {
                            channel: Arg::node("ch"),
                            value: Arg::inline(Expr::int_lit(2)),
                        }),
                        then: Arg::inline(Expr::Send {
                            channel: Arg::node("ch"),
                            value: Arg::inline(Expr::int_lit(3)),
                        }),
                    }),
                },
            ),
            Node::expr(
                "receiver",
                Expr::ListOf {
                    elements: vec![
                        Arg::inline(Expr::Recv {
                            channel: Arg::node("ch"),
                        }),
                        Arg::inline(Expr::Recv {
                            channel: Arg::node("ch"),
                        }),
                        Arg::inline(Expr::Recv {
                            channel: Arg::node("ch"),
                        }),
                    ],
                },
            ),
            Node::expr(
                "r",
                Expr::Par {
                    branches: vec!["sender".into(), "receiver".into()],
                },
            ),
        ],
        "r",
    );
    assert_eq!(
        eval(&doc),
        Value::List(vec![
            Value::Void,
            Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
        ])
    );
}

#[test]
fn await_timeout_uses_the_fallback() {
    let doc = async_doc(
        vec![
            Node::expr(
                "forever",
                Expr::While {
                    cond: Arg::inline(Expr::bool_lit(true)),
                    body: Arg::inline(Expr::int_lit(1)),
                },
            ),
            Node::expr(
                "s",
                Expr::Spawn {
                    task: "forever".into(),
                },
            ),
            Node::expr(
                "r",
                Expr::Await {
                    future: Arg::node("s"),
                    timeout: Some(200),
                    fallback: Some(Arg::inline(Expr::int_lit(-1))),
                    return_index: false,
                },
            ),
        ],
        "r",
    );
    assert_eq!(eval(&doc), Value::Int(-1));
}

#[test]
fn await_timeout_without_fallback_is_a_timeout_error() {
    let doc = async_doc(
        vec![
            Node::expr(
                "forever",
                Expr::While {
                    cond: Arg::inline(Expr::bool_lit(true)),
                    body: Arg::inline(Expr::int_lit(1)),
                },
            ),
            Node::expr(
                "s",
                Expr::Spawn {
                    task: "forever".into(),
                },
            ),
            Node::expr(
                "r",
                Expr::Await {
                    future: Arg::node("s"),
                    timeout: Some(200),
                    fallback: None,
                    return_index: false,
                },
            ),
        ],
        "r",
    );
    let out = eval(&doc);
    assert_eq!(out.as_error().unwrap().code, ErrorCode::Timeout);
}

#[test]
fn select_returns_the_first_completion_with_index() {
    let doc = async_doc(
        vec![
            Node::expr("quick_work", Expr::int_lit(7)),
            Node::expr(
                "slow_work",
                Expr::While {
                    cond: Arg::inline(Expr::bool_lit(true)),
                    body: Arg::inline(Expr::int_lit(1)),
                },
            ),
            Node::expr(
                "quick",
                Expr::Spawn {
                    task: "quick_work".into(),
                },
            ),
            Node::expr(
                "slow",
                Expr::Spawn {
                    task: "slow_work".into(),
                },
            ),
            Node::expr(
                "r",
                Expr::Select {
                    futures: vec!["quick".into(), "slow".into()],
                    timeout: Some(10_000),
                    fallback: None,
                    return_index: true,
                },
            ),
        ],
        "r",
    );
    match eval(&doc) {
        Value::Map(m) => {
            assert_eq!(m.get(&Value::str("index")), Some(&Value::Int(0)));
            assert_eq!(m.get(&Value::str("value")), Some(&Value::Int(7)));
        }
        other => panic!("expected index/value map, got {other}"),
    }
}

#[test]
fn select_timeout_yields_index_minus_one() {
    let doc = async_doc(
        vec![
            Node::expr(
                "slow_work",
                Expr::While {
                    cond: Arg::inline(Expr::bool_lit(true)),
                    body: Arg::inline(Expr::int_lit(1)),
                },
            ),
            Node::expr(
                "slow",
                Expr::Spawn {
                    task: "slow_work".into(),
                },
            ),
            Node::expr(
                "r",
                Expr::Select {
                    futures: vec!["slow".into()],
                    timeout: Some(150),
                    fallback: Some(Arg::inline(Expr::int_lit(0))),
                    return_index: true,
                },
            ),
        ],
        "r",
    );
    match eval(&doc) {
        Value::Map(m) => {
            assert_eq!(m.get(&Value::str("index")), Some(&Value::Int(-1)));
            assert_eq!(m.get(&Value::str("value")), Some(&Value::Int(0)));
        }
        other => panic!("expected index/value map, got {other}"),
    }
}

#[test]
fn race_returns_the_winner() {
    let doc = async_doc(
        vec![
            Node::expr("quick_work", Expr::int_lit(99)),
            Node::expr(
                "slow_work",
                Expr::While {
                    cond: Arg::inline(Expr::bool_lit(true)),
                    body: Arg::inline(Expr::int_lit(1)),
                },
            ),
            Node::expr(
                "quick",
                Expr::Spawn {
                    task: "quick_work".into(),
                },
            ),
            Node::expr(
                "slow",
                Expr::Spawn {
                    task: "slow_work".into(),
                },
            ),
            Node::expr(
                "r",
                Expr::Race {
                    tasks: vec!["quick".into(), "slow".into()],
                },
            ),
        ],
        "r",
    );
    assert_eq!(eval(&doc), Value::Int(99));
}

#[test]
fn channel_effects_are_logged_with_task_attribution() {
    let doc = async_doc(
        vec![
            Node::expr(
                "ch",
                Expr::Channel {
                    channel_type: SpiralType::Int,
                    buffer_size: Some(2),
                },
            ),
            Node::expr(
                "sender",
                Expr::Seq {
                    first: Arg::inline(Expr::Send {
                        channel: Arg::node("ch"),
                        value: Arg::inline(Expr::int_lit(1)),
                    }),
                    then: Arg::inline(Expr::Send {
                        channel: Arg::node("ch"),
                        value: Arg::inline(Expr::int_lit(2)),
                    }),
                },
            ),
            Node::expr(
                "receiver",
                Expr::Seq {
                    first: Arg::inline(Expr::Recv {
                        channel: Arg::node("ch"),
                    }),
                    then: Arg::inline(Expr::Recv {
                        channel: Arg::node("ch"),
                    }),
                },
            ),
            Node::expr(
                "r",
                Expr::Par {
                    branches: vec!["sender".into(), "receiver".into()],
                },
            ),
        ],
        "r",
    );
    let (out, log) = async_evaluator().evaluate_program_traced(&doc).unwrap();
    assert!(matches!(out, Value::List(_)));

    let stats = log.stats();
    assert_eq!(stats.by_op["send"], 2);
    assert_eq!(stats.by_op["recv"], 2);

    // Sequence numbers are strictly increasing.
    let seqs: Vec<u64> = log.entries().iter().map(|e| e.seq).collect();
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    assert_eq!(seqs, sorted);

    // Each sender entry carries its payload in program order.
    let entries = log.entries();
    let sends: Vec<&spiral_eval::EffectEntry> =
        entries.iter().filter(|e| e.op == "send").collect();
    assert_eq!(sends[0].args[1], Value::Int(1));
    assert_eq!(sends[1].args[1], Value::Int(2));
}

#[test]
fn pure_documents_run_identically_on_the_async_evaluator() {
    let doc = Document::new(
        "1.0.0",
        vec![
            Node::expr("a", Expr::int_lit(3)),
            Node::expr("b", Expr::int_lit(4)),
            Node::expr(
                "sum",
                Expr::call("core", "add", vec![Arg::node("a"), Arg::node("b")]),
            ),
        ],
        "sum",
    );
    assert_eq!(eval(&doc), Value::Int(7));
}

#[test]
fn sequential_mode_produces_the_same_result_for_independent_tasks() {
    let doc = async_doc(
        vec![
            Node::expr("a", Expr::int_lit(1)),
            Node::expr("b", Expr::int_lit(2)),
            Node::expr(
                "r",
                Expr::Par {
                    branches: vec!["a".into(), "b".into()],
                },
            ),
        ],
        "r",
    );
    let sequential = AsyncEvaluator::new(Rc::new(core_ops::registry()), Rc::new(DefRegistry::new()))
        .with_mode(ScheduleMode::Sequential)
        .evaluate_program(&doc)
        .unwrap();
    assert_eq!(sequential, eval(&doc));
}

#[test]
fn global_step_budget_cuts_off_runaway_programs() {
    let doc = async_doc(
        vec![Node::expr(
            "r",
            Expr::While {
                cond: Arg::inline(Expr::bool_lit(true)),
                body: Arg::inline(Expr::int_lit(1)),
            },
        )],
        "r",
    );
    let out = AsyncEvaluator::new(Rc::new(core_ops::registry()), Rc::new(DefRegistry::new()))
        .with_step_budget(2_000)
        .evaluate_program(&doc)
        .unwrap();
    assert_eq!(out.as_error().unwrap().code, ErrorCode::GlobalStepLimit);
}

#[test]
fn assignment_and_deref_work_across_the_run() {
    let doc = async_doc(
        vec![
            Node::expr(
                "setup",
                Expr::Assign {
                    target: "x".into(),
                    value: Arg::inline(Expr::int_lit(5)),
                },
            ),
            Node::expr("cell", Expr::RefCell { target: "x".into() }),
            Node::expr(
                "r",
                Expr::Seq {
                    first: Arg::node("setup"),
                    then: Arg::inline(Expr::Seq {
                        first: Arg::node("cell"),
                        then: Arg::inline(Expr::Deref { target: "x".into() }),
                    }),
                },
            ),
        ],
        "r",
    );
    assert_eq!(eval(&doc), Value::Int(5));
}
