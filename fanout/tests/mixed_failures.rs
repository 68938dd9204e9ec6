use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fanout::{ExecuteError, SyncDispatcher};

#[test]
fn every_failing_callable_is_preserved_in_the_aggregated_failure() {
    let mut dispatcher = SyncDispatcher::new(4).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));

    for i in 0..5 {
        let ran = Arc::clone(&ran);
        dispatcher
            .add(move || {
                ran.fetch_add(1, Ordering::SeqCst);
                if i % 2 == 0 {
                    panic!("callable {i} failed on purpose");
                }
            })
            .unwrap();
    }

    let result = dispatcher.execute_and_wait();
    assert_eq!(ran.load(Ordering::SeqCst), 5, "a failing callable must not stop the others");

    match result {
        Err(ExecuteError::Failed(aggregated)) => {
            assert_eq!(aggregated.failures().len(), 3);
        }
        other => panic!("expected an aggregated callable failure, got {other:?}"),
    }

    // The dispatcher must still be usable after a failing cycle.
    dispatcher.execute_and_wait().unwrap_err();
    dispatcher.dispose().unwrap();
}
