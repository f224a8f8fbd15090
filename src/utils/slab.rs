/// Token-indexed storage for the event loop's connections.
///
/// Indices are small and reused after removal, so they double as poller
/// tokens. A freed index can be handed out again; callers holding a stale
/// token must check that the entry they find is still theirs.
pub(crate) struct Slab<T> {
    items: Vec<Option<T>>,

    /// Stack of free indices that can be reused.
    free: Vec<usize>,

    len: usize,
}

impl<T> Slab<T> {
    pub(crate) fn new(size: usize) -> Self {
        let items = (0..size).map(|_| None).collect();
        let free = (0..size).rev().collect();

        Self {
            items,
            free,
            len: 0,
        }
    }

    /// Inserts the value built from its own index and returns that index.
    ///
    /// If a free slot is available, it is reused. Otherwise, the slab grows
    /// exponentially.
    pub(crate) fn insert_with(&mut self, make: impl FnOnce(usize) -> T) -> usize {
        let index = match self.free.pop() {
            Some(i) => i,
            None => {
                let len = self.items.len();
                let new_len = if len == 0 { 1 } else { 2 * len };

                self.items.extend((len..new_len).map(|_| None));
                self.free.extend(((len + 1)..new_len).rev());

                len
            }
        };

        self.items[index] = Some(make(index));
        self.len += 1;

        index
    }

    /// Removes and returns the value stored at `index`, if any.
    pub(crate) fn remove(&mut self, index: usize) -> Option<T> {
        let item = self.items.get_mut(index)?.take()?;

        self.free.push(index);
        self.len -= 1;

        Some(item)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.items.get_mut(index)?.as_mut()
    }

    pub(crate) fn values(&self) -> impl Iterator<Item = &T> + '_ {
        self.items.iter().flatten()
    }

    /// Indices of occupied slots, in ascending order.
    pub(crate) fn keys(&self) -> impl Iterator<Item = usize> + '_ {
        self.items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| item.as_ref().map(|_| i))
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_are_reused_after_removal() {
        let mut slab = Slab::new(2);

        let a = slab.insert_with(|i| i * 10);
        let b = slab.insert_with(|i| i * 10);
        assert_eq!((a, b), (0, 1));
        assert_eq!(slab.get_mut(b).copied(), Some(10));

        assert_eq!(slab.remove(a), Some(0));
        assert_eq!(slab.remove(a), None);
        assert_eq!(slab.insert_with(|_| 7), a);
        assert_eq!(slab.len(), 2);
    }

    #[test]
    fn grows_when_full() {
        let mut slab = Slab::new(0);

        let tokens: Vec<usize> = (0..5).map(|n| slab.insert_with(|_| n)).collect();
        assert_eq!(tokens, [0, 1, 2, 3, 4]);
        assert_eq!(slab.keys().collect::<Vec<_>>(), tokens);
        assert_eq!(slab.values().copied().collect::<Vec<_>>(), tokens);

        *slab.get_mut(3).unwrap() = 30;
        assert_eq!(slab.get_mut(3).copied(), Some(30));
        assert!(slab.get_mut(9).is_none());
    }
}
