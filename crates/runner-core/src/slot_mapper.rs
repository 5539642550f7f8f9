//! Computes where newly-computed K/V vectors land inside the physical paged
//! cache for each scheduled token, collapsing consecutive in-page tokens into
//! one `(kv_cache_start_index, new_kv_start_index, slice_len)` triple.
//!
//! Ported from `eSurgeRunner._get_slot_mapping_metadata`.

use crate::page_table::PageTable;

/// One contiguous run of tokens landing in a single physical page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotMappingTriple {
    pub kv_cache_start_index: u32,
    pub new_kv_start_index: u32,
    pub slice_len: u32,
}

pub struct SlotMapper;

impl SlotMapper {
    /// `num_computed_tokens`/`scheduled` are parallel slices, local to this
    /// sub-batch (index `i`), but page-table rows are addressed by the
    /// absolute slot `slot_offset + i` so a sub-batch can start partway
    /// through the dense prefix (see `Runner`'s oversize-step splitting).
    pub fn compute(
        page_table: &PageTable,
        page_size: usize,
        slot_offset: usize,
        num_computed_tokens: &[usize],
        scheduled: &[usize],
    ) -> Vec<SlotMappingTriple> {
        let mut out = Vec::new();
        let mut running_new_kv_start: u32 = 0;

        for i in 0..num_computed_tokens.len() {
            let start = num_computed_tokens[i];
            let end = start + scheduled[i];
            if scheduled[i] == 0 {
                continue;
            }

            let abs_slot = slot_offset + i;
            let first_logical_page = start / page_size;
            let last_logical_page = (end - 1) / page_size;

            for logical_page in first_logical_page..=last_logical_page {
                let intra_start = if logical_page == first_logical_page { start % page_size } else { 0 };
                let intra_end = if logical_page == last_logical_page {
                    (end - 1) % page_size + 1
                } else {
                    page_size
                };
                let slice_len = (intra_end - intra_start) as u32;
                let physical_page = page_table.physical_page(abs_slot, logical_page);

                out.push(SlotMappingTriple {
                    kv_cache_start_index: physical_page * page_size as u32 + intra_start as u32,
                    new_kv_start_index: running_new_kv_start,
                    slice_len,
                });
                running_new_kv_start += slice_len;
            }
        }

        out
    }

    /// Pad the triple array to `padded_num_slices` with zeroed triples, and
    /// transpose to `[3, padded_num_slices]` the way the forward pass expects.
    pub fn pad_and_transpose(triples: &[SlotMappingTriple], padded_num_slices: usize) -> [Vec<u32>; 3] {
        assert!(triples.len() <= padded_num_slices, "slot mapping overflowed its padding bucket");
        let mut kv_start = vec![0u32; padded_num_slices];
        let mut new_kv_start = vec![0u32; padded_num_slices];
        let mut slice_len = vec![0u32; padded_num_slices];
        for (i, t) in triples.iter().enumerate() {
            kv_start[i] = t.kv_cache_start_index;
            new_kv_start[i] = t.new_kv_start_index;
            slice_len[i] = t.slice_len;
        }
        [kv_start, new_kv_start, slice_len]
    }
}
