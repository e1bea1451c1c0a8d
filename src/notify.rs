use std::{
    future::{Future, IntoFuture},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use crate::BoxFuture;

/// Fires a one-way signal to every [`Listener`] created from the same channel.
#[derive(Debug, Clone)]
pub(crate) struct Trigger(Arc<tokio::sync::watch::Sender<bool>>);

impl Trigger {
    pub(crate) fn fire(&self) {
        self.0.send_replace(true);
        tracing::trace!("sending close signal");
    }

    pub(crate) fn listener(&self) -> Listener {
        Listener(self.0.subscribe())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Listener(tokio::sync::watch::Receiver<bool>);

impl Listener {
    pub(crate) fn is_fired(&self) -> bool {
        *self.0.borrow()
    }
}

impl IntoFuture for Listener {
    type IntoFuture = Notified;
    type Output = ();

    fn into_future(mut self) -> Self::IntoFuture {
        Notified(Box::pin(async move {
            // A trigger dropped without firing never fires.
            if self.0.wait_for(|fired| *fired).await.is_err() {
                std::future::pending::<()>().await;
            }
        }))
    }
}

#[pin_project::pin_project]
pub(crate) struct Notified(#[pin] BoxFuture<'static, ()>);

impl std::fmt::Debug for Notified {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Notified").finish()
    }
}

impl Future for Notified {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project().0.poll(cx)
    }
}

pub(crate) fn channel() -> (Trigger, Listener) {
    let (tx, rx) = tokio::sync::watch::channel(false);
    (Trigger(Arc::new(tx)), Listener(rx))
}
