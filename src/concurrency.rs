//! Fan-in helpers over Tokio channels.
//!
//! Every helper spawns its own relay tasks and returns a `JoinHandle` that
//! resolves once all inputs are drained. Outputs close when the last relay
//! drops its sender, so a consumer sees end-of-stream exactly once and only
//! after every input value has been delivered.

use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

/// Capacity of caller-facing streams. Tokio has no rendezvous channel, one
/// slot is the closest equivalent and keeps producers paced by consumers.
pub const STREAM_CAPACITY: usize = 1;

/// Folds every value of every input into one accumulator.
///
/// One reader task is spawned per input; readers share the accumulator
/// behind a lock. When all inputs have closed the final accumulator is sent
/// once on `output` and `output` is dropped.
pub fn reduce<I, A, F>(
    inputs: Vec<mpsc::Receiver<I>>,
    output: mpsc::Sender<A>,
    fold: F,
    initial: A,
) -> JoinHandle<()>
where
    I: Send + 'static,
    A: Send + 'static,
    F: Fn(I, A) -> A + Send + Sync + 'static,
{
    let fold = Arc::new(fold);
    let acc = Arc::new(Mutex::new(Some(initial)));

    let readers = inputs
        .into_iter()
        .map(|mut input| {
            let fold = fold.clone();
            let acc = acc.clone();
            tokio::spawn(async move {
                while let Some(value) = input.recv().await {
                    let mut guard = acc.lock().await;
                    if let Some(current) = guard.take() {
                        *guard = Some(fold(value, current));
                    }
                }
            })
        })
        .collect::<Vec<_>>();

    tokio::spawn(async move {
        for res in join_all(readers).await {
            if let Err(e) = res {
                log::error!("Reducer input task failed: {}", e);
            }
        }
        let result = acc.lock().await.take();
        if let Some(result) = result {
            if output.send(result).await.is_err() {
                log::debug!("Reducer output dropped before the result was delivered");
            }
        }
    })
}

/// Relays every value of every input onto `output` unchanged.
pub fn merge<T>(inputs: Vec<mpsc::Receiver<T>>, output: mpsc::Sender<T>) -> JoinHandle<()>
where
    T: Send + 'static,
{
    let relays = inputs
        .into_iter()
        .map(|mut input| {
            let output = output.clone();
            tokio::spawn(async move {
                while let Some(value) = input.recv().await {
                    if output.send(value).await.is_err() {
                        // Nobody is listening any more; drain so the producer is not stalled.
                        while input.recv().await.is_some() {}
                        break;
                    }
                }
            })
        })
        .collect::<Vec<_>>();
    drop(output);

    tokio::spawn(async move {
        for res in join_all(relays).await {
            if let Err(e) = res {
                log::error!("Merger relay task failed: {}", e);
            }
        }
    })
}

/// Splits one stream into two that both see every value.
///
/// If one side is dropped the other keeps receiving.
pub fn tee<T>(mut input: mpsc::Receiver<T>) -> (mpsc::Receiver<T>, mpsc::Receiver<T>)
where
    T: Clone + Send + 'static,
{
    let (left_tx, left_rx) = mpsc::channel(STREAM_CAPACITY);
    let (right_tx, right_rx) = mpsc::channel(STREAM_CAPACITY);

    tokio::spawn(async move {
        let mut left = Some(left_tx);
        let mut right = Some(right_tx);
        while let Some(value) = input.recv().await {
            if let Some(tx) = &left {
                if tx.send(value.clone()).await.is_err() {
                    left = None;
                }
            }
            if let Some(tx) = &right {
                if tx.send(value).await.is_err() {
                    right = None;
                }
            }
        }
    });

    (left_rx, right_rx)
}
