use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fanout::SyncDispatcher;

#[test]
fn both_callables_run_exactly_once_per_trigger() {
    let mut dispatcher = SyncDispatcher::new(2).unwrap();
    let a = Arc::new(AtomicUsize::new(0));
    let b = Arc::new(AtomicUsize::new(0));

    let a2 = Arc::clone(&a);
    dispatcher.add(move || { a2.fetch_add(1, Ordering::SeqCst); }).unwrap();
    let b2 = Arc::clone(&b);
    dispatcher.add(move || { b2.fetch_add(1, Ordering::SeqCst); }).unwrap();

    dispatcher.execute_and_wait().unwrap();

    assert_eq!(a.load(Ordering::SeqCst), 1);
    assert_eq!(b.load(Ordering::SeqCst), 1);

    dispatcher.execute_and_wait().unwrap();
    assert_eq!(a.load(Ordering::SeqCst), 2);
    assert_eq!(b.load(Ordering::SeqCst), 2);

    dispatcher.dispose().unwrap();
}
