//! The root table: a system table recording every user table and index
//! so they can be reconstructed when the database is reopened, plus the
//! `Database` facade the parser and REPL drive.

use std::cell::RefCell;
use std::rc::Rc;

use log::info;

use crate::accessor::{Accessor, BasicAccessor};
use crate::allocator::BitmapAllocator;
use crate::block::{BlockIndex, FileBlockDevice, FileHeader};
use crate::btree::BTree;
use crate::error::{Error, Result};
use crate::schema::{Field, FieldType, Schema};
use crate::table::Table;

const ALLOCATOR_START: BlockIndex = 1;

fn root_table_schema() -> Schema {
    Schema {
        fields: vec![
            Field { id: 0, name: "id".into(), ty: FieldType::Integer, length: 4 },
            Field { id: 1, name: "name".into(), ty: FieldType::Char, length: 32 },
            Field { id: 2, name: "data".into(), ty: FieldType::Integer, length: 4 },
            Field { id: 3, name: "count".into(), ty: FieldType::Integer, length: 4 },
            Field { id: 4, name: "index_for".into(), ty: FieldType::Char, length: 32 },
            Field { id: 5, name: "create_sql".into(), ty: FieldType::Char, length: 256 },
        ],
        primary_id: 0,
    }
}

struct RootRow {
    id: i32,
    name: String,
    data: BlockIndex,
    count: u32,
    index_for: String,
    create_sql: String,
}

/// Owns the device/accessor and every open `Table`, loaded from (and
/// serialized back to) the root table on open/close.
pub struct Database {
    accessor: Accessor,
    root_schema: Schema,
    root_tree: Rc<RefCell<BTree>>,
    tables: Vec<Table>,
    next_id: i32,
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let mut dev = FileBlockDevice::open(path)?;
        let mut header_buf = [0u8; crate::block::BLOCK_SIZE];
        crate::block::BlockDevice::read_block(&mut dev, 0, &mut header_buf)?;

        let root_schema = root_table_schema();

        let (header, fresh) = match FileHeader::read(&header_buf) {
            Some(h) => (h, false),
            None => (
                FileHeader {
                    root_table_root: 0,
                    root_table_count: 0,
                },
                true,
            ),
        };

        let mut allocator = BitmapAllocator::open(&mut dev, ALLOCATOR_START)?;
        if fresh {
            allocator.reset(&mut dev)?;
        }
        let accessor = BasicAccessor::new(dev, allocator);

        let row_size = root_schema.row_size();
        let root_tree = if fresh {
            info!("root_table: initializing a fresh database at {path}");
            BTree::create(&accessor, root_schema.primary().width(), row_size, BTree::lexicographic_comparator())?
        } else {
            BTree::open(&accessor, header.root_table_root, root_schema.primary().width(), row_size, BTree::lexicographic_comparator())
        };
        let root_tree = Rc::new(RefCell::new(root_tree));

        let mut db = Database {
            accessor,
            root_schema,
            root_tree,
            tables: Vec::new(),
            next_id: 1,
        };

        if !fresh {
            db.load_tables()?;
        } else {
            db.write_header()?;
        }

        Ok(db)
    }

    fn load_tables(&mut self) -> Result<()> {
        let rows: Vec<RootRow> = {
            let tree = self.root_tree.borrow();
            let mut it = tree.begin()?;
            let mut out = Vec::new();
            while let Some((_, row)) = it.next() {
                out.push(self.decode_row(&row)?);
            }
            out
        };

        for row in &rows {
            self.next_id = self.next_id.max(row.data as i32 + 2);
        }

        for row in rows.iter().filter(|r| r.index_for.is_empty()) {
            let schema = Schema::from_def_string(&row.create_sql)?;
            let table = Table::open(&self.accessor, row.name.clone(), schema, row.data, row.count);
            self.tables.push(table);
        }

        for row in rows.iter().filter(|r| !r.index_for.is_empty()) {
            if let Some(table) = self.tables.iter_mut().find(|t| t.name == row.index_for) {
                let col_field = table
                    .schema
                    .field(&row.create_sql)
                    .ok_or_else(|| Error::ColumnNotFound(row.create_sql.clone()))?;
                let primary_width = table.schema.primary().width();
                let key_width = col_field.width() + primary_width;
                let tree = BTree::open(&self.accessor, row.data, key_width, 0, BTree::lexicographic_comparator());
                table.indexes.push(crate::table::Index {
                    name: row.name.clone(),
                    column: row.create_sql.clone(),
                    tree: Rc::new(RefCell::new(tree)),
                });
            }
        }
        Ok(())
    }

    fn decode_row(&self, row: &[u8]) -> Result<RootRow> {
        let s = &self.root_schema;
        let get = |name: &str| -> &[u8] {
            let off = s.offset_of(name).unwrap();
            let w = s.field(name).unwrap().width();
            &row[off..off + w]
        };
        Ok(RootRow {
            id: crate::schema::to_string(FieldType::Integer, get("id"))?.parse().unwrap_or(0),
            name: crate::schema::to_string(FieldType::Char, get("name"))?,
            data: crate::schema::to_string(FieldType::Integer, get("data"))?.parse().unwrap_or(0),
            count: crate::schema::to_string(FieldType::Integer, get("count"))?.parse().unwrap_or(0),
            index_for: crate::schema::to_string(FieldType::Char, get("index_for"))?,
            create_sql: crate::schema::to_string(FieldType::Char, get("create_sql"))?,
        })
    }

    fn write_header(&mut self) -> Result<()> {
        let root = self.root_tree.borrow().root_block();
        let mut handle = crate::accessor::PageHandle::acquire(&self.accessor, 0)?;
        let header = FileHeader {
            root_table_root: root,
            root_table_count: self.tables.len() as u32,
        };
        header.write(handle.as_mut_slice());
        Ok(())
    }

    pub fn create_table(&mut self, name: &str, schema: Schema) -> Result<()> {
        if self.tables.iter().any(|t| t.name == name) {
            return Err(Error::TableExists(name.to_string()));
        }
        let table = Table::create(&self.accessor, name.to_string(), schema)?;
        self.record_table_row(&table)?;
        self.tables.push(table);
        Ok(())
    }

    pub fn drop_table(&mut self, name: &str) -> Result<()> {
        let pos = self.tables.iter().position(|t| t.name == name).ok_or_else(|| Error::TableNotFound(name.to_string()))?;
        self.tables.remove(pos);
        self.erase_root_rows_for(name)?;
        Ok(())
    }

    pub fn create_index(&mut self, table_name: &str, index_name: &str, column: &str) -> Result<()> {
        let table = self.get_table_mut(table_name)?;
        table.create_index(index_name.to_string(), column.to_string())?;
        let index_root = table.indexes.last().unwrap().tree.borrow().root_block();
        self.record_index_row(table_name, index_name, column, index_root)
    }

    pub fn drop_index(&mut self, table_name: &str, index_name: &str) -> Result<()> {
        let table = self.get_table_mut(table_name)?;
        table.drop_index(index_name)?;
        self.erase_root_rows_for(index_name)
    }

    pub fn get_table(&self, name: &str) -> Result<&Table> {
        self.tables.iter().find(|t| t.name == name).ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    pub fn get_table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables.iter_mut().find(|t| t.name == name).ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }

    fn next_root_id(&mut self) -> i32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn record_table_row(&mut self, table: &Table) -> Result<()> {
        let id = self.next_root_id();
        self.insert_root_row(id, &table.name, table.primary_root(), table.row_count, "", &table.schema.to_def_string())
    }

    pub fn record_index_row(&mut self, table_name: &str, index_name: &str, column: &str, index_root: BlockIndex) -> Result<()> {
        let id = self.next_root_id();
        self.insert_root_row(id, index_name, index_root, 0, table_name, column)
    }

    fn insert_root_row(&mut self, id: i32, name: &str, data: BlockIndex, count: u32, index_for: &str, create_sql: &str) -> Result<()> {
        let s = &self.root_schema;
        let mut buf = vec![0u8; s.row_size()];
        self.write_field(&mut buf, "id", FieldType::Integer, &id.to_string())?;
        self.write_field(&mut buf, "name", FieldType::Char, name)?;
        self.write_field(&mut buf, "data", FieldType::Integer, &(data as i32).to_string())?;
        self.write_field(&mut buf, "count", FieldType::Integer, &(count as i32).to_string())?;
        self.write_field(&mut buf, "index_for", FieldType::Char, index_for)?;
        self.write_field(&mut buf, "create_sql", FieldType::Char, create_sql)?;

        let key_offset = s.offset_of("id").unwrap();
        let key_width = s.field("id").unwrap().width();
        let key = buf[key_offset..key_offset + key_width].to_vec();

        let mut tree = self.root_tree.borrow_mut();
        let mut it = tree.insert(&key)?;
        let mut handle = it.value_mut()?;
        let off = it.value_offset();
        handle.as_mut_slice()[off..off + buf.len()].copy_from_slice(&buf);
        Ok(())
    }

    fn write_field(&self, buf: &mut [u8], name: &str, ty: FieldType, literal: &str) -> Result<()> {
        let off = self.root_schema.offset_of(name).unwrap();
        let field = self.root_schema.field(name).unwrap();
        let encoded = crate::schema::from_string(ty, field.length, literal)?;
        buf[off..off + encoded.len()].copy_from_slice(&encoded);
        Ok(())
    }

    fn erase_root_rows_for(&mut self, name: &str) -> Result<()> {
        let matches: Vec<Vec<u8>> = {
            let tree = self.root_tree.borrow();
            let mut it = tree.begin()?;
            let mut keys = Vec::new();
            while let Some((key, row)) = it.next() {
                let decoded = self.decode_row(&row)?;
                if decoded.name == name || decoded.index_for == name {
                    keys.push(key.as_slice().to_vec());
                }
            }
            keys
        };
        for key in matches {
            self.root_tree.borrow_mut().erase(&key)?;
        }
        Ok(())
    }

    /// Serializes every table/index back into the root table, and
    /// writes the updated root block index and row count into block 0.
    pub fn close(mut self) -> Result<()> {
        self.sync()
    }

    /// Refreshes every table's and index's root-table row: a tree's root
    /// block can move (promotion on split) between opens, so the row
    /// recorded at creation time can go stale.
    fn sync(&mut self) -> Result<()> {
        let rows: Vec<RootRow> = {
            let tree = self.root_tree.borrow();
            let mut it = tree.begin()?;
            let mut out = Vec::new();
            while let Some((_, row)) = it.next() {
                out.push(self.decode_row(&row)?);
            }
            out
        };

        for row in &rows {
            let (new_data, new_count) = if row.index_for.is_empty() {
                let Some(table) = self.tables.iter().find(|t| t.name == row.name) else { continue };
                (table.primary_root(), table.row_count)
            } else {
                let Some(table) = self.tables.iter().find(|t| t.name == row.index_for) else { continue };
                let Some(index) = table.indexes.iter().find(|i| i.name == row.name) else { continue };
                (index.tree.borrow().root_block(), 0)
            };
            if new_data == row.data && new_count == row.count {
                continue;
            }
            let key_width = self.root_schema.primary().width();
            let key = crate::schema::from_string(FieldType::Integer, 4, &row.id.to_string())?;
            let _ = key_width;
            self.root_tree.borrow_mut().erase(&key)?;
            self.insert_root_row(row.id, &row.name, new_data, new_count, &row.index_for, &row.create_sql)?;
        }

        self.write_header()?;
        self.accessor.borrow_mut().flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Field, FieldType};

    fn temp_db_path(name: &str) -> String {
        std::env::temp_dir()
            .join(format!("cdb-root-table-test-{name}-{}", std::process::id()))
            .to_string_lossy()
            .into_owned()
    }

    fn widgets_schema() -> Schema {
        Schema {
            fields: vec![
                Field { id: 0, name: "id".into(), ty: FieldType::Integer, length: 4 },
                Field { id: 1, name: "label".into(), ty: FieldType::Char, length: 16 },
            ],
            primary_id: 0,
        }
    }

    #[test]
    fn create_table_is_visible_after_reopen() {
        let path = temp_db_path("reopen");
        std::fs::remove_file(&path).ok();

        let mut db = Database::open(&path).unwrap();
        db.create_table("widgets", widgets_schema()).unwrap();
        db.get_table_mut("widgets")
            .unwrap()
            .insert(&widgets_schema(), &[vec![0u8; widgets_schema().row_size()]])
            .unwrap();
        db.close().unwrap();

        let reopened = Database::open(&path).unwrap();
        assert_eq!(reopened.table_names(), vec!["widgets"]);
        assert_eq!(reopened.get_table("widgets").unwrap().row_count, 1);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn drop_table_removes_it_from_the_root_table() {
        let path = temp_db_path("drop");
        std::fs::remove_file(&path).ok();

        let mut db = Database::open(&path).unwrap();
        db.create_table("widgets", widgets_schema()).unwrap();
        db.drop_table("widgets").unwrap();
        assert!(db.get_table("widgets").is_err());
        db.close().unwrap();

        let reopened = Database::open(&path).unwrap();
        assert!(reopened.table_names().is_empty());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn create_index_survives_reopen() {
        let path = temp_db_path("index");
        std::fs::remove_file(&path).ok();

        let mut db = Database::open(&path).unwrap();
        db.create_table("widgets", widgets_schema()).unwrap();
        db.create_index("widgets", "by_label", "label").unwrap();
        db.close().unwrap();

        let reopened = Database::open(&path).unwrap();
        let table = reopened.get_table("widgets").unwrap();
        assert_eq!(table.indexes.len(), 1);
        assert_eq!(table.indexes[0].name, "by_label");

        std::fs::remove_file(&path).ok();
    }
}
