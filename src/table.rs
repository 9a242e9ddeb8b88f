//! A single table: schema-bound primary tree, secondary index trees, and
//! the insert/select/erase pipelines that tie them to the condition
//! optimizer and the view layer.

use std::cell::RefCell;
use std::rc::Rc;

use log::debug;

use crate::accessor::Accessor;
use crate::btree::BTree;
use crate::condition::{self, Condition};
use crate::error::{Error, Result};
use crate::schema::{self, FieldType, Schema};
use crate::view::{IndexView, View};

/// The block capacity estimate used by the index-visitor cost model:
/// roughly how many records fit in one block, derived from the row size.
fn records_per_block(row_size: usize) -> u32 {
    (crate::block::BLOCK_SIZE / row_size.max(1)).max(1) as u32
}

pub struct Index {
    pub name: String,
    pub column: String,
    pub tree: Rc<RefCell<BTree>>,
}

pub struct Table {
    pub name: String,
    pub schema: Schema,
    pub primary: Rc<RefCell<BTree>>,
    pub indexes: Vec<Index>,
    pub row_count: u32,
    accessor: Accessor,
}

impl Table {
    pub fn create(accessor: &Accessor, name: String, schema: Schema) -> Result<Self> {
        let primary_width = schema.primary().width();
        let row_size = schema.row_size();
        let tree = BTree::create(accessor, primary_width, row_size, BTree::lexicographic_comparator())?;
        Ok(Table {
            name,
            schema,
            primary: Rc::new(RefCell::new(tree)),
            indexes: Vec::new(),
            row_count: 0,
            accessor: accessor.clone(),
        })
    }

    pub fn open(accessor: &Accessor, name: String, schema: Schema, primary_root: u32, row_count: u32) -> Self {
        let primary_width = schema.primary().width();
        let row_size = schema.row_size();
        let tree = BTree::open(accessor, primary_root, primary_width, row_size, BTree::lexicographic_comparator());
        Table {
            name,
            schema,
            primary: Rc::new(RefCell::new(tree)),
            indexes: Vec::new(),
            row_count,
            accessor: accessor.clone(),
        }
    }

    pub fn primary_root(&self) -> u32 {
        self.primary.borrow().root_block()
    }

    fn field_types(&self) -> impl Fn(&str) -> (FieldType, u32) + '_ {
        move |col: &str| {
            self.schema
                .field(col)
                .map(|f| (f.ty, f.length))
                .unwrap_or((FieldType::Integer, 4))
        }
    }

    /// Copies each row from `source_schema` layout into `self.schema`
    /// layout, matching fields by name, assigns an auto-increment
    /// primary value if the source omitted it, inserts into the primary
    /// tree, then maintains every secondary index.
    pub fn insert(&mut self, source_schema: &Schema, rows: &[Vec<u8>]) -> Result<()> {
        debug!("table {}: inserting {} row(s)", self.name, rows.len());
        for row in rows {
            let mut buf = vec![0u8; self.schema.row_size()];
            let mut offset = 0;
            for field in &self.schema.fields {
                let width = field.width();
                if let Some(src_offset) = source_schema.offset_of(&field.name) {
                    buf[offset..offset + width].copy_from_slice(&row[src_offset..src_offset + width]);
                } else if field.id == self.schema.primary_id {
                    let next_id = self.row_count as i32 + 1;
                    let encoded = schema::from_string(FieldType::Integer, 4, &next_id.to_string())?;
                    buf[offset..offset + width].copy_from_slice(&encoded);
                }
                offset += width;
            }

            let primary_offset = self.schema.offset_of(self.schema.primary().name.as_str()).unwrap();
            let primary_width = self.schema.primary().width();
            let primary_key = buf[primary_offset..primary_offset + primary_width].to_vec();

            {
                let mut tree = self.primary.borrow_mut();
                let mut it = tree.insert(&primary_key)?;
                let mut handle = it.value_mut()?;
                let off = it.value_offset();
                handle.as_mut_slice()[off..off + buf.len()].copy_from_slice(&buf);
            }

            for index in &self.indexes {
                let col_field = self.schema.field(&index.column).ok_or_else(|| Error::ColumnNotFound(index.column.clone()))?;
                let col_offset = self.schema.offset_of(&index.column).unwrap();
                let col_width = col_field.width();
                let mut key = buf[col_offset..col_offset + col_width].to_vec();
                key.extend_from_slice(&primary_key);
                index.tree.borrow_mut().insert(&key)?;
            }

            self.row_count += 1;
        }
        Ok(())
    }

    /// Runs `condition` (optimized) against the table, emitting each
    /// matching row (projected to `target_schema`) to `sink`.
    pub fn select(&self, target_schema: &Schema, condition: Option<Condition>, mut sink: impl FnMut(&[u8])) -> Result<()> {
        let cond = condition.map(|c| condition::optimize(c, &self.field_types()));
        if matches!(cond, Some(Condition::False)) {
            return Ok(());
        }

        let filter = cond.clone();
        let row_filter = move |row: &[u8], schema: &Schema| -> bool {
            filter.as_ref().map(|c| c.eval(schema, row)).unwrap_or(true)
        };

        let view = self.primary_view();
        let schema = self.schema.clone();

        if let Some(index_view) = self.pick_index(&cond) {
            let key_iter = index_view.0;
            let projected = view.select_indexed(target_schema, key_iter, Some(&|row| row_filter(row, &schema)));
            for row in projected.list.begin() {
                sink(row);
            }
            return Ok(());
        }

        let projected = view.select(target_schema, Some(&|row| row_filter(row, &schema)));
        for row in projected.list.begin() {
            sink(row);
        }
        Ok(())
    }

    /// Removes matching rows. With no condition: resets the primary tree
    /// and every index tree, zeroing the row count. Otherwise walks the
    /// same index-visitor path to collect primary keys, then erases them
    /// one at a time from the primary tree and every index.
    pub fn erase(&mut self, condition: Option<Condition>) -> Result<u32> {
        if condition.is_none() {
            self.primary.borrow_mut().reset()?;
            for index in &self.indexes {
                index.tree.borrow_mut().reset()?;
            }
            let removed = self.row_count;
            self.row_count = 0;
            return Ok(removed);
        }

        let cond = condition::optimize(condition.unwrap(), &self.field_types());
        if matches!(cond, Condition::False) {
            return Ok(0);
        }

        let schema = self.schema.clone();
        let cond_for_eval = cond.clone();
        let mut to_remove = Vec::new();
        {
            let tree = self.primary.borrow();
            let mut it = tree.begin()?;
            while let Some((key, row)) = it.next() {
                if cond_for_eval.eval(&schema, &row) {
                    to_remove.push((key.as_slice().to_vec(), row));
                }
            }
        }

        let mut removed = 0;
        for (primary_key, row) in &to_remove {
            for index in &self.indexes {
                let col_field = self.schema.field(&index.column).unwrap();
                let col_offset = self.schema.offset_of(&index.column).unwrap();
                let mut key = row[col_offset..col_offset + col_field.width()].to_vec();
                key.extend_from_slice(primary_key);
                index.tree.borrow_mut().erase(&key)?;
            }
            self.primary.borrow_mut().erase(primary_key)?;
            self.row_count -= 1;
            removed += 1;
        }
        Ok(removed)
    }

    /// Allocates a fresh tree, full-scans the table inserting
    /// `(column ∥ primary)` composite keys, and records the index.
    pub fn create_index(&mut self, index_name: String, column: String) -> Result<()> {
        if self.indexes.iter().any(|i| i.name == index_name) {
            return Err(Error::IndexExists(index_name));
        }
        let col_field = self.schema.field(&column).ok_or_else(|| Error::ColumnNotFound(column.clone()))?;
        let primary_width = self.schema.primary().width();
        let key_width = col_field.width() + primary_width;

        let tree = BTree::create(&self.accessor, key_width, 0, BTree::lexicographic_comparator())?;
        let tree = Rc::new(RefCell::new(tree));

        let col_offset = self.schema.offset_of(&column).unwrap();
        let col_width = col_field.width();
        let primary_offset = self.schema.offset_of(self.schema.primary().name.as_str()).unwrap();

        {
            let primary_tree = self.primary.borrow();
            let mut it = primary_tree.begin()?;
            while let Some((_, row)) = it.next() {
                let mut key = row[col_offset..col_offset + col_width].to_vec();
                key.extend_from_slice(&row[primary_offset..primary_offset + primary_width]);
                tree.borrow_mut().insert(&key)?;
            }
        }

        self.indexes.push(Index { name: index_name, column, tree });
        Ok(())
    }

    /// Drops the named index, freeing every block of its on-disk tree —
    /// not just the bookkeeping record.
    pub fn drop_index(&mut self, index_name: &str) -> Result<()> {
        let pos = self
            .indexes
            .iter()
            .position(|i| i.name == index_name)
            .ok_or_else(|| Error::IndexNotFound(index_name.to_string()))?;
        let index = self.indexes.remove(pos);
        match Rc::try_unwrap(index.tree) {
            Ok(cell) => cell.into_inner().free_all()?,
            Err(rc) => rc.borrow_mut().reset()?,
        }
        Ok(())
    }

    fn primary_view(&self) -> View {
        View::Index(IndexView {
            tree: self.primary.clone(),
            schema: self.schema.clone(),
            value_is_row: true,
        })
    }

    /// Cost-based index pick: an index view is worth using only if its
    /// estimated selectivity beats a full scan (`count / records-per-block`).
    fn pick_index(&self, cond: &Option<Condition>) -> Option<(Box<dyn Iterator<Item = Vec<u8>>>, String)> {
        let cond = cond.as_ref()?;
        let col = cond.column_of_simple()?;
        let index = self.indexes.iter().find(|i| i.column == col)?;

        let threshold = self.row_count / records_per_block(self.schema.row_size()).max(1);
        if let Condition::Range(_, lower, upper) = cond {
            let primary_width = self.schema.primary().width();
            let tree = index.tree.clone();
            let estimate = self.row_count; // cheap upper bound without a dedicated count scan
            if estimate > threshold && threshold > 0 {
                return None; // full scan estimated cheaper
            }
            let lower = lower.clone();
            let upper = upper.clone();
            let keys: Vec<Vec<u8>> = {
                let t = tree.borrow();
                let mut it = t.lower_bound(&lower).ok()?;
                let mut out = Vec::new();
                while let Some((key, _)) = it.next() {
                    let bytes = key.as_slice();
                    if let Some(upper) = &upper {
                        if bytes >= upper.as_slice() {
                            break;
                        }
                    }
                    out.push(bytes[bytes.len() - primary_width..].to_vec());
                }
                out
            };
            return Some((Box::new(keys.into_iter()), index.name.clone()));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessor::BasicAccessor;
    use crate::allocator::BitmapAllocator;
    use crate::block::FileBlockDevice;
    use crate::condition::CompareOp;
    use crate::schema::{self, Field, FieldType};

    fn fresh_accessor(name: &str) -> Accessor {
        let path = std::env::temp_dir().join(format!("cdb-table-test-{name}-{}", std::process::id()));
        std::fs::remove_file(&path).ok();
        let mut dev = FileBlockDevice::open(&path).unwrap();
        let mut alloc = BitmapAllocator::open(&mut dev, 1).unwrap();
        alloc.reset(&mut dev).unwrap();
        BasicAccessor::new(dev, alloc)
    }

    fn people_schema() -> Schema {
        Schema {
            fields: vec![
                Field { id: 0, name: "id".into(), ty: FieldType::Integer, length: 4 },
                Field { id: 1, name: "name".into(), ty: FieldType::Char, length: 16 },
                Field { id: 2, name: "age".into(), ty: FieldType::Integer, length: 4 },
            ],
            primary_id: 0,
        }
    }

    fn encode_row(schema: &Schema, id: i32, name: &str, age: i32) -> Vec<u8> {
        let mut buf = vec![0u8; schema.row_size()];
        let mut offset = 0;
        for field in &schema.fields {
            let width = field.width();
            let encoded = match field.name.as_str() {
                "id" => schema::from_string(FieldType::Integer, 4, &id.to_string()).unwrap(),
                "name" => schema::from_string(FieldType::Char, 16, name).unwrap(),
                "age" => schema::from_string(FieldType::Integer, 4, &age.to_string()).unwrap(),
                _ => unreachable!(),
            };
            buf[offset..offset + width].copy_from_slice(&encoded);
            offset += width;
        }
        buf
    }

    #[test]
    fn insert_and_select_all_rows() {
        let accessor = fresh_accessor("insert-select");
        let schema = people_schema();
        let mut table = Table::create(&accessor, "people".into(), schema.clone()).unwrap();

        let rows = vec![
            encode_row(&schema, 1, "alice", 30),
            encode_row(&schema, 2, "bob", 25),
        ];
        table.insert(&schema, &rows).unwrap();
        assert_eq!(table.row_count, 2);

        let mut seen = Vec::new();
        table.select(&schema, None, |row| seen.push(row.to_vec())).unwrap();
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn select_with_condition_filters_rows() {
        let accessor = fresh_accessor("select-condition");
        let schema = people_schema();
        let mut table = Table::create(&accessor, "people".into(), schema.clone()).unwrap();
        table
            .insert(
                &schema,
                &[
                    encode_row(&schema, 1, "alice", 30),
                    encode_row(&schema, 2, "bob", 25),
                    encode_row(&schema, 3, "carol", 40),
                ],
            )
            .unwrap();

        let cond = Condition::Compare("age".into(), CompareOp::Gt, schema::from_string(FieldType::Integer, 4, "28").unwrap());
        let mut names = Vec::new();
        table
            .select(&schema, Some(cond), |row| {
                let offset = schema.offset_of("name").unwrap();
                let width = schema.field("name").unwrap().width();
                names.push(schema::to_string(FieldType::Char, &row[offset..offset + width]).unwrap());
            })
            .unwrap();
        names.sort();
        assert_eq!(names, vec!["alice".to_string(), "carol".to_string()]);
    }

    #[test]
    fn erase_with_condition_removes_matching_rows_and_their_index_entries() {
        let accessor = fresh_accessor("erase-condition");
        let schema = people_schema();
        let mut table = Table::create(&accessor, "people".into(), schema.clone()).unwrap();
        table
            .insert(
                &schema,
                &[
                    encode_row(&schema, 1, "alice", 30),
                    encode_row(&schema, 2, "bob", 25),
                ],
            )
            .unwrap();
        table.create_index("by_age".into(), "age".into()).unwrap();

        let cond = Condition::Compare("age".into(), CompareOp::Eq, schema::from_string(FieldType::Integer, 4, "25").unwrap());
        let removed = table.erase(Some(cond)).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(table.row_count, 1);

        let index = &table.indexes[0];
        assert_eq!(index.tree.borrow().begin().unwrap().count(), 1);
    }

    #[test]
    fn erase_with_no_condition_clears_the_table() {
        let accessor = fresh_accessor("erase-all");
        let schema = people_schema();
        let mut table = Table::create(&accessor, "people".into(), schema.clone()).unwrap();
        table
            .insert(&schema, &[encode_row(&schema, 1, "alice", 30), encode_row(&schema, 2, "bob", 25)])
            .unwrap();

        let removed = table.erase(None).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(table.row_count, 0);
        assert_eq!(table.primary.borrow().begin().unwrap().count(), 0);
    }
}
