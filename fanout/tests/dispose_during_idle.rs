use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fanout::SyncDispatcher;

#[test]
fn dispose_joins_every_worker_and_leaves_nothing_runnable() {
    let mut dispatcher = SyncDispatcher::new(4).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..4 {
        let ran = Arc::clone(&ran);
        dispatcher.add(move || { ran.fetch_add(1, Ordering::SeqCst); }).unwrap();
    }

    dispatcher.execute_and_wait().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 4);

    dispatcher.dispose().unwrap();

    // A second dispose is a usage error, not a panic or a hang.
    assert!(dispatcher.dispose().is_err());
}
