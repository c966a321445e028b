use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Page, PageId, PAGE_SIZE};

const RECORD_COUNT_OFFSET: usize = 0;
const RECORDS_OFFSET: usize = 8;
const NAME_SIZE: usize = 32;
const RECORD_SIZE: usize = NAME_SIZE + 4;
const MAX_RECORDS: usize = (PAGE_SIZE - RECORDS_OFFSET) / RECORD_SIZE;

/// Accessor for the database header page (page 0), which maps index names
/// to their root page ids. Record layout: a `u32` record count followed by
/// fixed-size records of a zero-padded 32-byte name and an `i32` root page
/// id. A blank page decodes as zero records.
pub struct HeaderPage;

impl HeaderPage {
    pub fn new() -> Self {
        Self
    }

    pub fn record_count(&self, page: &Page) -> usize {
        LittleEndian::read_u32(&page.data[RECORD_COUNT_OFFSET..RECORD_COUNT_OFFSET + 4]) as usize
    }

    /// Insert a `(name, root_page_id)` record. Returns false when the name
    /// is too long, already present, or the page is full.
    pub fn insert_record(&self, page: &mut Page, name: &str, root_page_id: PageId) -> bool {
        if name.len() > NAME_SIZE || name.is_empty() {
            return false;
        }
        let count = self.record_count(page);
        if count >= MAX_RECORDS || self.find_record(page, name).is_some() {
            return false;
        }

        let offset = RECORDS_OFFSET + count * RECORD_SIZE;
        page.data[offset..offset + NAME_SIZE].fill(0);
        page.data[offset..offset + name.len()].copy_from_slice(name.as_bytes());
        LittleEndian::write_i32(
            &mut page.data[offset + NAME_SIZE..offset + RECORD_SIZE],
            root_page_id,
        );
        LittleEndian::write_u32(
            &mut page.data[RECORD_COUNT_OFFSET..RECORD_COUNT_OFFSET + 4],
            (count + 1) as u32,
        );
        true
    }

    /// Update the root page id of an existing record. Returns false when
    /// the name is unknown.
    pub fn update_record(&self, page: &mut Page, name: &str, root_page_id: PageId) -> bool {
        match self.find_record(page, name) {
            Some(index) => {
                let offset = RECORDS_OFFSET + index * RECORD_SIZE;
                LittleEndian::write_i32(
                    &mut page.data[offset + NAME_SIZE..offset + RECORD_SIZE],
                    root_page_id,
                );
                true
            }
            None => false,
        }
    }

    /// Remove a record, compacting the tail over it.
    pub fn delete_record(&self, page: &mut Page, name: &str) -> bool {
        let count = self.record_count(page);
        match self.find_record(page, name) {
            Some(index) => {
                let start = RECORDS_OFFSET + index * RECORD_SIZE;
                let end = RECORDS_OFFSET + count * RECORD_SIZE;
                page.data.copy_within(start + RECORD_SIZE..end, start);
                LittleEndian::write_u32(
                    &mut page.data[RECORD_COUNT_OFFSET..RECORD_COUNT_OFFSET + 4],
                    (count - 1) as u32,
                );
                true
            }
            None => false,
        }
    }

    /// Look up the root page id recorded under `name`.
    pub fn get_record(&self, page: &Page, name: &str) -> Option<PageId> {
        self.find_record(page, name).map(|index| {
            let offset = RECORDS_OFFSET + index * RECORD_SIZE;
            LittleEndian::read_i32(&page.data[offset + NAME_SIZE..offset + RECORD_SIZE])
        })
    }

    fn find_record(&self, page: &Page, name: &str) -> Option<usize> {
        if name.len() > NAME_SIZE {
            return None;
        }
        let mut padded = [0u8; NAME_SIZE];
        padded[..name.len()].copy_from_slice(name.as_bytes());

        let count = self.record_count(page);
        (0..count).find(|&i| {
            let offset = RECORDS_OFFSET + i * RECORD_SIZE;
            page.data[offset..offset + NAME_SIZE] == padded
        })
    }
}

impl Default for HeaderPage {
    fn default() -> Self {
        Self::new()
    }
}
