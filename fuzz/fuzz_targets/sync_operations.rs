#![no_main]

use backoff_stack::{BackoffConfig, Operation, Stack};
use libfuzzer_sys::fuzz_target;
use std::sync::Arc;

fuzz_target!(|ops: Vec<Operation<i32>>| {
    let stack = Arc::new(Stack::with_backoff(BackoffConfig::low_latency()).unwrap());

    let mut threads = vec![];

    let len = ops.len();
    let mut expected_min = 0;

    for sub_ops in ops.chunks(std::cmp::max(len / 20, 1)) {
        let sub_ops = sub_ops.to_vec();
        let stack = stack.clone();

        expected_min += sub_ops
            .iter()
            .map(|op| match op {
                Operation::Push { .. } => 1,
                Operation::Append { items } => items.len(),
                _ => 0,
            })
            .sum::<usize>();

        threads.push(std::thread::spawn(move || {
            sub_ops.into_iter().for_each(|op| match op {
                Operation::Pop => {
                    let _ = stack.pop();
                }
                Operation::PopPush => {
                    if let Ok(e) = stack.pop() {
                        stack.push(e.wrapping_mul(e))
                    }
                }
                Operation::Push { item } => stack.push(item),
                Operation::Append { items } => {
                    let other: Stack<_> = items.into_iter().collect();
                    stack.append(other);
                }
                Operation::Count => {
                    let _ = stack.operation_count();
                }
            })
        }))
    }

    for thread in threads {
        thread.join().unwrap()
    }

    assert!(stack.operation_count() >= expected_min);
});
