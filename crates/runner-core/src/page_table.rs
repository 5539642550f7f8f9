//! Logical-slot -> physical-page addressing for the paged KV cache.
//!
//! One `PageTable` exists per KV-cache group; `MultiGroupPageTable` bundles
//! them so row operations (`swap_row`/`move_row`) happen atomically across
//! every group a request is present in, matching
//! `easydel.../sequence_buffer.py`'s `MultiGroupPageTable`.

use runner_common::{Result, RunnerError};

/// Dense `[max_num_seqs, max_num_pages_per_req]` table of physical page ids
/// for a single cache group.
#[derive(Debug, Clone)]
pub struct PageTable {
    max_num_pages_per_req: usize,
    /// row length actually in use, so `append_row` knows where to continue.
    row_lens: Vec<usize>,
    rows: Vec<Vec<u32>>,
}

impl PageTable {
    pub fn new(max_num_reqs: usize, max_num_pages_per_req: usize) -> Self {
        Self {
            max_num_pages_per_req,
            row_lens: vec![0; max_num_reqs],
            rows: vec![vec![0u32; max_num_pages_per_req]; max_num_reqs],
        }
    }

    /// Overwrite row `slot` with `page_ids` starting at column 0. The
    /// remainder of the row is don't-care until the next `append_row`.
    pub fn add_row(&mut self, page_ids: &[u32], slot: usize) -> Result<()> {
        self.check_capacity(page_ids.len())?;
        let row = &mut self.rows[slot];
        row[..page_ids.len()].copy_from_slice(page_ids);
        self.row_lens[slot] = page_ids.len();
        Ok(())
    }

    /// Append `new_page_ids` starting at the row's current length.
    pub fn append_row(&mut self, new_page_ids: &[u32], slot: usize) -> Result<()> {
        let start = self.row_lens[slot];
        self.check_capacity(start + new_page_ids.len())?;
        let row = &mut self.rows[slot];
        row[start..start + new_page_ids.len()].copy_from_slice(new_page_ids);
        self.row_lens[slot] = start + new_page_ids.len();
        Ok(())
    }

    pub fn swap_row(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.rows.swap(a, b);
        self.row_lens.swap(a, b);
    }

    pub fn move_row(&mut self, src: usize, dst: usize) {
        if src == dst {
            return;
        }
        let row = self.rows[src].clone();
        self.rows[dst] = row;
        self.row_lens[dst] = self.row_lens[src];
    }

    /// A `[num_rows_used, max_num_pages_per_req]` view, row-major.
    pub fn get_array(&self, num_rows_used: usize) -> Vec<&[u32]> {
        self.rows[..num_rows_used].iter().map(|r| r.as_slice()).collect()
    }

    pub fn row_len(&self, slot: usize) -> usize {
        self.row_lens[slot]
    }

    pub fn physical_page(&self, slot: usize, logical_page: usize) -> u32 {
        self.rows[slot][logical_page]
    }

    fn check_capacity(&self, needed: usize) -> Result<()> {
        if needed > self.max_num_pages_per_req {
            return Err(RunnerError::CapacityExceeded(format!(
                "request needs {needed} pages but max_num_pages_per_req is {}",
                self.max_num_pages_per_req
            )));
        }
        Ok(())
    }
}

/// All cache-group page tables for a `SequenceBuffer`, kept in lockstep: a
/// request is always present across every group simultaneously, so row
/// mutations apply to all groups in one call.
#[derive(Debug, Clone)]
pub struct MultiGroupPageTable {
    groups: Vec<PageTable>,
}

impl MultiGroupPageTable {
    pub fn new(max_num_reqs: usize, max_num_pages_per_req: usize, num_groups: usize) -> Self {
        Self {
            groups: (0..num_groups.max(1))
                .map(|_| PageTable::new(max_num_reqs, max_num_pages_per_req))
                .collect(),
        }
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn group(&self, i: usize) -> &PageTable {
        &self.groups[i]
    }

    pub fn add_row(&mut self, page_ids: &[Vec<u32>], slot: usize) -> Result<()> {
        for (group, ids) in self.groups.iter_mut().zip(page_ids.iter()) {
            group.add_row(ids, slot)?;
        }
        Ok(())
    }

    pub fn append_row(&mut self, new_page_ids: &[Vec<u32>], slot: usize) -> Result<()> {
        for (group, ids) in self.groups.iter_mut().zip(new_page_ids.iter()) {
            group.append_row(ids, slot)?;
        }
        Ok(())
    }

    pub fn swap_row(&mut self, a: usize, b: usize) {
        for group in &mut self.groups {
            group.swap_row(a, b);
        }
    }

    pub fn move_row(&mut self, src: usize, dst: usize) {
        for group in &mut self.groups {
            group.move_row(src, dst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_row_then_append_extends_length() {
        let mut pt = PageTable::new(4, 8);
        pt.add_row(&[1, 2, 3], 0).unwrap();
        assert_eq!(pt.row_len(0), 3);
        pt.append_row(&[4, 5], 0).unwrap();
        assert_eq!(pt.row_len(0), 5);
        assert_eq!(pt.physical_page(0, 4), 5);
    }

    #[test]
    fn add_row_past_capacity_is_fatal() {
        let mut pt = PageTable::new(4, 2);
        let err = pt.add_row(&[1, 2, 3], 0).unwrap_err();
        assert!(matches!(err, RunnerError::CapacityExceeded(_)));
    }

    #[test]
    fn swap_row_exchanges_full_rows() {
        let mut pt = PageTable::new(4, 4);
        pt.add_row(&[1, 2], 0).unwrap();
        pt.add_row(&[9], 1).unwrap();
        pt.swap_row(0, 1);
        assert_eq!(pt.row_len(0), 1);
        assert_eq!(pt.physical_page(0, 0), 9);
        assert_eq!(pt.row_len(1), 2);
        assert_eq!(pt.physical_page(1, 0), 1);
    }

    #[test]
    fn move_row_copies_without_clearing_source() {
        let mut pt = PageTable::new(4, 4);
        pt.add_row(&[7, 8], 0).unwrap();
        pt.move_row(0, 2);
        assert_eq!(pt.row_len(2), 2);
        assert_eq!(pt.physical_page(2, 1), 8);
    }

    #[test]
    fn multi_group_moves_all_groups_atomically() {
        let mut mg = MultiGroupPageTable::new(4, 4, 2);
        mg.add_row(&[vec![1, 2], vec![10, 20]], 0).unwrap();
        mg.swap_row(0, 1);
        assert_eq!(mg.group(0).physical_page(1, 0), 1);
        assert_eq!(mg.group(1).physical_page(1, 0), 10);
    }
}
