use anyhow::{bail, Result};
use env_logger::Env;
use itertools::Itertools;
use std::io::{self, BufRead, Write};

use cdb::parser::{self, Statement};
use cdb::schema::{self, Schema};
use cdb::Database;

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args: std::env::Args = std::env::args();
    let args: Vec<String> = args.collect();
    if args.len() < 2 {
        bail!("Missing <database path>");
    }

    let mut db = Database::open(&args[1])?;
    println!("cdb: opened {}", args[1]);

    if args.len() > 2 && args[2] == "--execfile" && args.len() > 3 {
        run_file(&mut db, &args[3])?;
        db.close()?;
        return Ok(());
    }

    let stdin = io::stdin();
    let mut out = io::stdout();
    loop {
        print!("cdb> ");
        out.flush().ok();

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match run_line(&mut db, line) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => println!("error: {e}"),
        }
    }

    db.close()?;
    Ok(())
}

fn run_file(db: &mut Database, path: &str) -> Result<()> {
    let contents = std::fs::read_to_string(path)?;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !run_line(db, line)? {
            break;
        }
    }
    Ok(())
}

/// Executes one statement. Returns `Ok(false)` on `quit`.
fn run_line(db: &mut Database, line: &str) -> Result<bool> {
    let statement = parser::parse(line)?;
    match statement {
        Statement::Quit => return Ok(false),
        Statement::CreateTable { name, schema } => {
            db.create_table(&name, schema)?;
            println!("table {name} created");
        }
        Statement::DropTable { name } => {
            db.drop_table(&name)?;
            println!("table {name} dropped");
        }
        Statement::CreateIndex { index_name, table, column } => {
            db.create_index(&table, &index_name, &column)?;
            println!("index {index_name} created on {table}({column})");
        }
        Statement::DropIndex { table, index_name } => {
            db.drop_index(&table, &index_name)?;
            println!("index {index_name} dropped");
        }
        Statement::Insert { table, columns, rows } => {
            let target = db.get_table(&table)?.schema.clone();
            let source_schema = match &columns {
                Some(names) => projected_schema(&target, names)?,
                None => target.clone(),
            };
            let mut encoded_rows = Vec::with_capacity(rows.len());
            for row in &rows {
                encoded_rows.push(encode_row(&source_schema, row)?);
            }
            let table = db.get_table_mut(&table)?;
            table.insert(&source_schema, &encoded_rows)?;
            println!("{} row(s) inserted", rows.len());
        }
        Statement::Select { columns, table, condition } => {
            let t = db.get_table(&table)?;
            let target = if columns.is_empty() {
                t.schema.clone()
            } else {
                projected_schema(&t.schema, &columns)?
            };
            let mut printed = 0;
            t.select(&target, condition, |row| {
                println!("{}", decode_row(&target, row));
                printed += 1;
            })?;
            println!("({printed} row(s))");
        }
        Statement::Delete { table, condition } => {
            let t = db.get_table_mut(&table)?;
            let removed = t.erase(condition)?;
            println!("{removed} row(s) deleted");
        }
        Statement::ExecFile { path } => {
            run_file(db, &path)?;
        }
    }
    Ok(true)
}

fn projected_schema(source: &Schema, names: &[String]) -> Result<Schema> {
    let mut fields = Vec::new();
    for name in names {
        let field = source
            .field(name)
            .ok_or_else(|| anyhow::anyhow!("no such column: {name}"))?;
        fields.push(field.clone());
    }
    let primary_id = source.primary_id;
    Ok(Schema { fields, primary_id })
}

fn encode_row(schema: &Schema, literals: &[String]) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; schema.row_size()];
    let mut offset = 0;
    for (field, literal) in schema.fields.iter().zip(literals.iter()) {
        let encoded = schema::from_string(field.ty, field.length, literal)?;
        buf[offset..offset + encoded.len()].copy_from_slice(&encoded);
        offset += field.width();
    }
    Ok(buf)
}

fn decode_row(schema: &Schema, row: &[u8]) -> String {
    let mut offset = 0;
    let mut parts = Vec::new();
    for field in &schema.fields {
        let width = field.width();
        let text = schema::to_string(field.ty, &row[offset..offset + width]).unwrap_or_else(|_| "?".to_string());
        parts.push(format!("{}={}", field.name, text));
        offset += width;
    }
    parts.iter().join(", ")
}
