//! Overflow chains for values too large to sit in a leaf.
//!
//! A chain is a linked list of overflow pages. Pages need not be contiguous,
//! which lets reclaimed pages from the freelist hold large values.

use log::trace;

use crate::btree::{PageReader, PageWriter};
use crate::error::{Error, Result};
use crate::page::{encode_overflow, overflow_capacity, overflow_pages_for};
use crate::types::PageNo;

/// Store `value` in a new chain and return its first page
pub(crate) fn write_chain<W: PageWriter + ?Sized>(w: &mut W, value: &[u8]) -> Result<PageNo> {
    let ps = w.page_size();
    let count = overflow_pages_for(value.len(), ps);
    let mut pgnos = Vec::with_capacity(count);
    for _ in 0..count {
        pgnos.push(w.alloc()?);
    }
    for (i, chunk) in value.chunks(overflow_capacity(ps)).enumerate() {
        let next = pgnos.get(i + 1).copied();
        w.write(pgnos[i], encode_overflow(pgnos[i], next, chunk, ps));
    }
    trace!("wrote {} byte value into {} overflow pages", value.len(), count);
    pgnos.first().copied().ok_or(Error::Corrupted("empty overflow chain"))
}

/// Reassemble a value of `len` bytes starting at `pgno`
pub(crate) fn read_chain<R: PageReader + ?Sized>(r: &R, pgno: PageNo, len: usize) -> Result<Vec<u8>> {
    let mut value = Vec::with_capacity(len);
    let mut next = Some(pgno);
    let mut remaining = overflow_pages_for(len, r.page_size());
    while let Some(pgno) = next {
        if remaining == 0 {
            return Err(Error::Corrupted("overflow chain longer than its value"));
        }
        remaining -= 1;
        let (chunk, link) = r.page(pgno)?.overflow()?;
        value.extend_from_slice(chunk);
        next = link;
    }
    if value.len() != len {
        return Err(Error::Corrupted("overflow chain length mismatch"));
    }
    Ok(value)
}

/// Release every page of a chain; returns the number of pages freed
pub(crate) fn free_chain<W: PageWriter + ?Sized>(w: &mut W, pgno: PageNo, len: usize) -> Result<usize> {
    let expected = overflow_pages_for(len, w.page_size());
    let mut next = Some(pgno);
    let mut freed = 0;
    while let Some(pgno) = next {
        if freed == expected {
            return Err(Error::Corrupted("overflow chain longer than its value"));
        }
        next = w.page(pgno)?.overflow()?.1;
        w.free(pgno);
        freed += 1;
    }
    Ok(freed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::mem::MemPages;
    use crate::constants::PAGE_SIZE;

    #[test]
    fn chain_reassembles_exact_bytes() {
        let mut pages = MemPages::new(1000);
        let value: Vec<u8> = (0..3 * overflow_capacity(PAGE_SIZE) + 17).map(|i| (i * 31 % 256) as u8).collect();
        let head = write_chain(&mut pages, &value).unwrap();
        assert_eq!(read_chain(&pages, head, value.len()).unwrap(), value);
        assert!(matches!(read_chain(&pages, head, value.len() - 1), Err(Error::Corrupted(_))));
        assert_eq!(free_chain(&mut pages, head, value.len()).unwrap(), 4);
        assert_eq!(pages.freed.len(), 4);
    }
}
