// One-shot event waiters: the first matching event resolves the oldest
// pending waiter and deregisters it.
use tokio::sync::oneshot;

pub(crate) struct Waiters<E> {
    pending: Vec<Waiter<E>>,
}

struct Waiter<E> {
    predicate: Box<dyn Fn(&E) -> bool + Send>,
    resolve: oneshot::Sender<()>,
}

impl<E> Default for Waiters<E> {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
        }
    }
}

impl<E> Waiters<E> {
    /// Park a waiter until an event satisfies `predicate`. The returned
    /// receiver completes at most once; it errors out if the session ends
    /// while the waiter is still pending.
    pub(crate) fn register(
        &mut self,
        predicate: impl Fn(&E) -> bool + Send + 'static,
    ) -> oneshot::Receiver<()> {
        let (resolve, wait) = oneshot::channel();
        self.pending.push(Waiter {
            predicate: Box::new(predicate),
            resolve,
        });
        wait
    }

    /// Resolve exactly the oldest waiter matching `event`. Non-matching
    /// waiters stay parked. Returns false when nothing matched.
    pub(crate) fn notify(&mut self, event: &E) -> bool {
        let Some(position) = self
            .pending
            .iter()
            .position(|waiter| (waiter.predicate)(event))
        else {
            return false;
        };
        let waiter = self.pending.remove(position);
        let _ = waiter.resolve.send(());
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.pending.len()
    }
}
