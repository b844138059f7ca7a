//! Broken double-checked-locking publication.
//!
//! The writer publishes the reference before initializing the field, so
//! there must be a consistent execution in which the reader observes
//! the non-null reference but the stale field contents. The checker
//! must report that execution rather than reject it.

use memforge::{Config, Loc};

mod utils;
use utils::{explore, object, Op, Operand, TestProgram};

#[test]
fn partially_constructed_object_is_observable() {
    let instance = Loc::global(0);
    let o = object(0);
    let field = Loc::new(o, 0);
    let program = TestProgram {
        threads: vec![
            vec![
                Op::Alloc(o),
                Op::WriteRef(instance, o),
                Op::Write(field, Operand::Const(42)),
            ],
            vec![Op::ReadRefThenField(instance, 0)],
        ],
        ..Default::default()
    };
    let result = explore(&program, Config::default());
    assert_eq!(result.stats.blocked, 0);

    let reader: Vec<_> = result.outcomes.iter().map(|o| o.reads[1].clone()).collect();
    // The reference bits are the raw object handle.
    let raw = 100;
    assert!(
        reader.contains(&vec![raw, 0]),
        "the stale field behind a published reference must be observable: {:?}",
        reader
    );
    assert!(reader.contains(&vec![raw, 42]));
    assert!(reader.contains(&vec![0]));
}
