//! Steps with undo.
//!
//! A multi-step mutation records how to reverse each step once it has
//! been committed. On failure the recorded undo actions run in reverse
//! order.

use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use tracing::debug;

pub(crate) struct Steps<'a> {
    undo: Vec<(&'static str, BoxFuture<'a, ()>)>,
}

impl<'a> Steps<'a> {
    pub fn new() -> Self {
        Self { undo: Vec::new() }
    }

    /// Record that `step` is done and how to reverse it. The undo future
    /// only runs if the sequence is unwound.
    pub fn committed<F>(&mut self, step: &'static str, undo: F)
    where
        F: Future<Output = ()> + Send + 'a,
    {
        self.undo.push((step, undo.boxed()));
    }

    pub fn len(&self) -> usize {
        self.undo.len()
    }

    /// Reverse every committed step, last first.
    pub async fn unwind(self) {
        for (step, undo) in self.undo.into_iter().rev() {
            debug!(step, "undoing step");
            undo.await;
        }
    }
}
