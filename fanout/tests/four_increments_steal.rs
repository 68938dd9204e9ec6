use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

use fanout::SyncDispatcher;

/// Four callables, `maxConcurrency = 2`: one caller node, one dedicated
/// worker, and two stealable nodes. Exercises the work-stealing path past
/// the initial fan-out.
#[test]
fn every_callable_runs_once_and_work_is_observed_from_multiple_threads() {
    let mut dispatcher = SyncDispatcher::new(2).unwrap();
    let counts: Arc<Vec<AtomicUsize>> = Arc::new((0..4).map(|_| AtomicUsize::new(0)).collect());
    let thread_ids: Arc<Mutex<HashSet<ThreadId>>> = Arc::new(Mutex::new(HashSet::new()));

    for i in 0..4 {
        let counts = Arc::clone(&counts);
        let thread_ids = Arc::clone(&thread_ids);
        dispatcher
            .add(move || {
                counts[i].fetch_add(1, Ordering::SeqCst);
                thread_ids.lock().unwrap().insert(std::thread::current().id());
            })
            .unwrap();
    }

    dispatcher.execute_and_wait().unwrap();

    for c in counts.iter() {
        assert_eq!(c.load(Ordering::SeqCst), 1);
    }
    assert!(
        thread_ids.lock().unwrap().len() >= 2,
        "expected callables to be observed from at least two distinct threads"
    );

    dispatcher.dispose().unwrap();
}
