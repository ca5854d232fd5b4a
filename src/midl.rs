use crate::types::PageNo;

/// Sorted list of page numbers, kept in descending order like LMDB's IDL so
/// that the lowest page number is popped first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct PageList {
    ids: Vec<PageNo>,
}

impl PageList {
    pub fn new() -> Self {
        Self { ids: Vec::new() }
    }

    #[cfg(test)]
    pub fn from_unsorted(mut ids: Vec<PageNo>) -> Self {
        ids.sort_unstable_by(|a, b| b.cmp(a));
        ids.dedup();
        Self { ids }
    }

    /// Get number of elements in the list
    #[inline]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Binary search for an id; returns the position it occupies or would occupy
    pub fn search(&self, id: PageNo) -> Result<usize, usize> {
        self.ids.binary_search_by(|probe| probe.cmp(&id).reverse())
    }

    #[cfg(test)]
    pub fn contains(&self, id: PageNo) -> bool {
        self.search(id).is_ok()
    }

    /// Insert keeping the order; duplicates are ignored
    pub fn insert(&mut self, id: PageNo) {
        if let Err(pos) = self.search(id) {
            self.ids.insert(pos, id);
        }
    }

    /// Merge another list into this one
    pub fn merge(&mut self, other: &[PageNo]) {
        if other.is_empty() {
            return;
        }
        self.ids.extend_from_slice(other);
        self.ids.sort_unstable_by(|a, b| b.cmp(a));
        self.ids.dedup();
    }

    /// Remove and return the lowest page number
    pub fn pop_lowest(&mut self) -> Option<PageNo> {
        self.ids.pop()
    }

    /// Drain every id, highest first
    pub fn take(&mut self) -> Vec<PageNo> {
        std::mem::take(&mut self.ids)
    }

    #[cfg(test)]
    pub fn as_slice(&self) -> &[PageNo] {
        &self.ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_descending_order() {
        let mut list = PageList::from_unsorted(vec![7, 3, 9, 3]);
        assert_eq!(list.as_slice(), &[9, 7, 3]);
        list.insert(5);
        list.insert(9);
        assert_eq!(list.as_slice(), &[9, 7, 5, 3]);
        list.merge(&[1, 8]);
        assert_eq!(list.as_slice(), &[9, 8, 7, 5, 3, 1]);
        assert!(list.contains(8));
        assert!(!list.contains(2));
    }

    #[test]
    fn pops_lowest_first() {
        let mut list = PageList::from_unsorted(vec![12, 4, 30]);
        assert_eq!(list.pop_lowest(), Some(4));
        assert_eq!(list.pop_lowest(), Some(12));
        assert_eq!(list.pop_lowest(), Some(30));
        assert_eq!(list.pop_lowest(), None);
        assert!(list.is_empty());
    }
}
