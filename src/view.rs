//! The view layer: a uniform row source over either a B+ tree or an
//! in-memory skip list, plus the set-ish operations the query engine
//! composes (`select`, `peek`, `intersect`, `join`).
//!
//! Modeled as one tagged enum per the design notes rather than a trait
//! object, so the pipeline's inner loop (one branch per call, not one
//! vtable dispatch per call) stays monomorphic-ish and easy to read.

use std::rc::Rc;
use std::cell::RefCell;

use crate::btree::{BTree, KeyBuf};
use crate::schema::Schema;
use crate::skiplist::SkipList;

pub type RowFilter<'a> = dyn Fn(&[u8]) -> bool + 'a;

pub enum View {
    Index(IndexView),
    Skip(SkipView),
}

pub struct IndexView {
    pub tree: Rc<RefCell<BTree>>,
    pub schema: Schema,
    /// true when the tree's value is the full row (a table's own primary
    /// tree); false when it is empty and the key alone is
    /// `(indexed ∥ primary)` (a secondary index).
    pub value_is_row: bool,
}

pub struct SkipView {
    pub list: SkipList,
    pub schema: Schema,
}

pub enum ViewIter<'a> {
    Index(crate::btree::Iter),
    Skip(crate::skiplist::SkipIter<'a>),
}

impl View {
    pub fn schema(&self) -> &Schema {
        match self {
            View::Index(v) => &v.schema,
            View::Skip(v) => &v.schema,
        }
    }

    /// Materializes every row passing `filter`, projected to
    /// `target_schema`, into a new skip list keyed by the target
    /// schema's primary column.
    pub fn select(&self, target_schema: &Schema, filter: Option<&RowFilter>) -> SkipView {
        let key_offset = target_schema.offset_of(target_schema.primary().name.as_str()).unwrap();
        let key_len = target_schema.primary().width();
        let mut out = SkipList::new(key_offset, key_len);

        match self {
            View::Index(v) => {
                let tree = v.tree.borrow();
                let mut it = tree.begin().expect("begin on an open tree cannot fail");
                while let Some((_, value)) = it.next() {
                    if filter.map(|f| f(&value)).unwrap_or(true) {
                        out.insert(project(&v.schema, target_schema, &value));
                    }
                }
            }
            View::Skip(v) => {
                for row in v.list.begin() {
                    if filter.map(|f| f(row)).unwrap_or(true) {
                        out.insert(project(&v.schema, target_schema, row));
                    }
                }
            }
        }

        SkipView {
            list: out,
            schema: target_schema.clone(),
        }
    }

    /// For each primary key in `[begin, end)` of `keys`, look this row up
    /// in `self` and project it to `target_schema`.
    pub fn select_indexed(
        &self,
        target_schema: &Schema,
        keys: impl Iterator<Item = Vec<u8>>,
        filter: Option<&RowFilter>,
    ) -> SkipView {
        let key_offset = target_schema.offset_of(target_schema.primary().name.as_str()).unwrap();
        let key_len = target_schema.primary().width();
        let mut out = SkipList::new(key_offset, key_len);

        if let View::Index(v) = self {
            let tree = v.tree.borrow();
            for key in keys {
                if let Ok(Some((found_key, value))) = tree.lower_bound(&key).map(|it| it.peek().ok().flatten()) {
                    if found_key.as_slice() == key.as_slice() && filter.map(|f| f(&value)).unwrap_or(true) {
                        out.insert(project(&v.schema, target_schema, &value));
                    }
                }
            }
        }

        SkipView {
            list: out,
            schema: target_schema.clone(),
        }
    }

    /// Enumerates rows whose `col` value falls in `[lower, upper)`,
    /// collecting primary keys into a skip list ordered by primary key.
    /// Only meaningful on a secondary index view, whose key already is
    /// `(col_value ∥ primary)`.
    pub fn peek(&self, lower: &[u8], upper: &[u8], primary_width: usize) -> SkipView {
        let mut out = SkipList::new(0, primary_width);
        if let View::Index(v) = self {
            let tree = v.tree.borrow();
            let mut it = tree.lower_bound(lower).expect("lower_bound cannot fail on an open tree");
            while let Some((key, _)) = it.next() {
                let bytes = key.as_slice();
                if bytes >= upper {
                    break;
                }
                let primary = bytes[bytes.len() - primary_width..].to_vec();
                out.insert(primary);
            }
        }
        SkipView {
            list: out,
            schema: Schema {
                fields: vec![v_primary_field(primary_width)],
                primary_id: 0,
            },
        }
    }
}

impl SkipView {
    /// Destructively retains only records whose primary key equals a
    /// primary key present in `other` (both already ordered).
    pub fn intersect(&mut self, other: &SkipList) {
        let keep: Vec<Vec<u8>> = {
            let mine = self.list.begin();
            let mut theirs = other.begin().peekable();
            let mut keep = Vec::new();
            for row in mine {
                let key = &row[self.list_key_range()];
                while theirs.peek().map(|o| &o[..key.len()] < key).unwrap_or(false) {
                    theirs.next();
                }
                if theirs.peek().map(|o| &o[..key.len()] == key).unwrap_or(false) {
                    keep.push(row.to_vec());
                }
            }
            keep
        };
        self.rebuild(keep);
    }

    /// Destructively adds primary keys from `other` missing from self
    /// (ordered union); added rows carry no payload beyond the key.
    pub fn join(&mut self, other: &SkipList) {
        for row in other.begin() {
            if self.list.lower_bound(row).peek().map(|v| v == row).unwrap_or(false) {
                continue;
            }
            self.list.insert(row.to_vec());
        }
    }

    fn list_key_range(&self) -> std::ops::Range<usize> {
        let offset = self.schema.offset_of(self.schema.primary().name.as_str()).unwrap();
        offset..offset + self.schema.primary().width()
    }

    fn rebuild(&mut self, rows: Vec<Vec<u8>>) {
        let offset = self.schema.offset_of(self.schema.primary().name.as_str()).unwrap();
        let width = self.schema.primary().width();
        let mut fresh = SkipList::new(offset, width);
        for row in rows {
            fresh.insert(row);
        }
        self.list = fresh;
    }
}

fn v_primary_field(width: usize) -> crate::schema::Field {
    crate::schema::Field {
        id: 0,
        name: "primary".into(),
        ty: crate::schema::FieldType::Char,
        length: width as u32,
    }
}

/// Copies the fields named in `target` out of a `source`-shaped row.
fn project(source: &Schema, target: &Schema, row: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; target.row_size()];
    let mut out_offset = 0;
    for field in &target.fields {
        if let Some(src_offset) = source.offset_of(&field.name) {
            let width = field.width();
            out[out_offset..out_offset + width].copy_from_slice(&row[src_offset..src_offset + width]);
        }
        out_offset += field.width();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Field, FieldType};

    fn schema() -> Schema {
        Schema {
            fields: vec![
                Field { id: 0, name: "id".into(), ty: FieldType::Integer, length: 4 },
                Field { id: 1, name: "val".into(), ty: FieldType::Integer, length: 4 },
            ],
            primary_id: 0,
        }
    }

    #[test]
    fn select_projects_matching_rows_from_a_skip_view() {
        let s = schema();
        let mut list = SkipList::new(0, 4);
        for i in 0..5i32 {
            let mut row = Vec::new();
            row.extend_from_slice(&i.to_le_bytes());
            row.extend_from_slice(&(i * 10).to_le_bytes());
            list.insert(row);
        }
        let view = View::Skip(SkipView { list, schema: s.clone() });
        let target = Schema { fields: vec![s.fields[0].clone()], primary_id: 0 };
        let projected = view.select(&target, None);
        assert_eq!(projected.list.len(), 5);
    }
}
