//! Correlation bridge between subscription reader tasks and awaiting callers.
//!
//! A dispatch call wants to read sequentially: "publish, then give me the
//! first reply". Replies arrive on a subscription owned by a reader task
//! that must keep running after the first reply (the completion phase comes
//! later on the same inbox). The bridge is the handoff: the reader resolves
//! a `Promise` exactly once, the caller suspends on the matching
//! `Completion`.
//!
//! If the resolving side goes away without resolving (transport died,
//! reader task aborted), the caller observes `BridgeError::Abandoned`
//! instead of hanging.

use thiserror::Error;
use tokio::sync::oneshot;

/// Failure outcomes a `Completion` can observe.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// The `Promise` was dropped without being resolved.
    #[error("promise abandoned before resolution")]
    Abandoned,

    /// The resolving side reported a failure.
    #[error("{0}")]
    Failed(String),
}

/// The resolving half. Consumed by `deliver` or `fail`.
pub struct Promise<T> {
    tx: oneshot::Sender<Result<T, BridgeError>>,
}

/// The awaiting half.
pub struct Completion<T> {
    rx: oneshot::Receiver<Result<T, BridgeError>>,
}

/// Creates a linked promise/completion pair.
pub fn promise<T>() -> (Promise<T>, Completion<T>) {
    let (tx, rx) = oneshot::channel();
    (Promise { tx }, Completion { rx })
}

impl<T> Promise<T> {
    /// Resolves the completion with a value.
    pub fn deliver(self, value: T) {
        // The caller may have stopped waiting; that is its prerogative.
        let _ = self.tx.send(Ok(value));
    }

    /// Resolves the completion with a failure.
    pub fn fail(self, reason: impl Into<String>) {
        let _ = self.tx.send(Err(BridgeError::Failed(reason.into())));
    }
}

impl<T> Completion<T> {
    /// Suspends until the promise is resolved.
    pub async fn wait(self) -> Result<T, BridgeError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Abandoned),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deliver_resolves_wait() {
        let (promise, completion) = promise::<u32>();
        tokio::spawn(async move {
            promise.deliver(7);
        });
        assert_eq!(completion.wait().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_fail_surfaces_reason() {
        let (promise, completion) = promise::<u32>();
        promise.fail("worker went away");
        let err = completion.wait().await.unwrap_err();
        assert_eq!(err, BridgeError::Failed("worker went away".to_string()));
    }

    #[tokio::test]
    async fn test_dropped_promise_is_abandoned() {
        let (promise, completion) = promise::<u32>();
        drop(promise);
        assert_eq!(completion.wait().await.unwrap_err(), BridgeError::Abandoned);
    }

    #[tokio::test]
    async fn test_deliver_after_caller_gone_is_harmless() {
        let (promise, completion) = promise::<u32>();
        drop(completion);
        promise.deliver(1);
    }
}
