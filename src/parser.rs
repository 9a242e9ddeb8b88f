//! SQL-ish statement grammar, parsed with `peg` into the engine's own
//! statement and condition ASTs.

use crate::condition::{CompareOp, Condition};
use crate::error::{Error, Result};
use crate::schema::{Field, FieldType, Schema};

#[derive(Debug, Clone)]
pub enum Statement {
    CreateTable { name: String, schema: Schema },
    DropTable { name: String },
    CreateIndex { index_name: String, table: String, column: String },
    DropIndex { table: String, index_name: String },
    Insert { table: String, columns: Option<Vec<String>>, rows: Vec<Vec<String>> },
    Select { columns: Vec<String>, table: String, condition: Option<Condition> },
    Delete { table: String, condition: Option<Condition> },
    ExecFile { path: String },
    Quit,
}

peg::parser! {
    grammar sql() for str {
        rule _() = [' ' | '\t' | '\n' | '\r']*
        rule ident() -> String
            = s:$(['a'..='z' | 'A'..='Z' | '_'] ['a'..='z' | 'A'..='Z' | '0'..='9' | '_']*) { s.to_string() }
        rule number() -> String
            = s:$("-"? ['0'..='9']+ ("." ['0'..='9']+)?) { s.to_string() }
        rule string_literal() -> String
            = "'" s:$((!['\''] [_])*) "'" { s.to_string() }
        rule literal() -> String = number() / string_literal()

        rule type_name() -> (FieldType, u32)
            = "INTEGER"i { (FieldType::Integer, 4) }
            / "FLOAT"i { (FieldType::Float, 4) }
            / "TEXT"i { (FieldType::Text, 4) }
            / "CHAR"i _ "(" _ n:$(['0'..='9']+) _ ")" { (FieldType::Char, n.parse().unwrap()) }

        rule column_def() -> (String, FieldType, u32, bool)
            = name:ident() _ ty:type_name() _ primary:("PRIMARY"i {true})? {
                (name, ty.0, ty.1, primary.unwrap_or(false))
            }

        rule create_table() -> Statement
            = "CREATE"i _ "TABLE"i _ name:ident() _ "(" _ cols:(column_def() ** (_ "," _)) _ ")" _ {?
                let mut fields = Vec::new();
                let mut primary_id = None;
                for (id, (col_name, ty, len, is_primary)) in cols.iter().enumerate() {
                    fields.push(Field { id: id as u32, name: col_name.clone(), ty: *ty, length: *len });
                    if *is_primary { primary_id = Some(id as u32); }
                }
                let primary_id = primary_id.unwrap_or(0);
                Ok(Statement::CreateTable { name, schema: Schema { fields, primary_id } })
            }

        rule drop_table() -> Statement
            = "DROP"i _ "TABLE"i _ name:ident() _ { Statement::DropTable { name } }

        rule create_index() -> Statement
            = "CREATE"i _ "INDEX"i _ index_name:ident() _ "ON"i _ table:ident() _ "(" _ column:ident() _ ")" _ {
                Statement::CreateIndex { index_name, table, column }
            }

        rule drop_index() -> Statement
            = "DROP"i _ "INDEX"i _ table:ident() _ "." _ index_name:ident() _ {
                Statement::DropIndex { table, index_name }
            }
            / "DROP"i _ "INDEX"i _ index_name:ident() _ "ON"i _ table:ident() _ {
                Statement::DropIndex { table, index_name }
            }

        rule value_tuple() -> Vec<String>
            = "(" _ vals:(literal() ** (_ "," _)) _ ")" { vals }

        rule column_list() -> Vec<String>
            = "(" _ cols:(ident() ** (_ "," _)) _ ")" { cols }

        rule insert() -> Statement
            = "INSERT"i _ "INTO"i _ table:ident() _ columns:(column_list() _)? "VALUES"i _ rows:(value_tuple() ** (_ "," _)) _ {
                Statement::Insert { table, columns: columns.map(|(c, _)| c), rows }
            }

        rule cmp_op() -> CompareOp
            = "!=" { CompareOp::Ne }
            / "<>" { CompareOp::Ne }
            / ">=" { CompareOp::Ge }
            / "<=" { CompareOp::Le }
            / "=" { CompareOp::Eq }
            / ">" { CompareOp::Gt }
            / "<" { CompareOp::Lt }

        rule compare() -> Condition
            = col:ident() _ op:cmp_op() _ lit:literal() {
                Condition::Compare(col, op, lit.into_bytes())
            }

        rule cond_atom() -> Condition
            = "(" _ c:condition() _ ")" { c }
            / compare()

        rule cond_and() -> Condition
            = first:cond_atom() rest:(_ "AND"i _ c:cond_atom() { c })* {
                rest.into_iter().fold(first, |acc, c| Condition::And(Box::new(acc), Box::new(c)))
            }

        rule condition() -> Condition
            = first:cond_and() rest:(_ "OR"i _ c:cond_and() { c })* {
                rest.into_iter().fold(first, |acc, c| Condition::Or(Box::new(acc), Box::new(c)))
            }

        rule star_or_columns() -> Vec<String>
            = "*" { vec![] }
            / cols:(ident() ** (_ "," _)) { cols }

        rule select() -> Statement
            = "SELECT"i _ columns:star_or_columns() _ "FROM"i _ table:ident() _ condition:("WHERE"i _ c:condition() { c })? _ {
                Statement::Select { columns, table, condition }
            }

        rule delete() -> Statement
            = "DELETE"i _ "FROM"i _ table:ident() _ condition:("WHERE"i _ c:condition() { c })? _ {
                Statement::Delete { table, condition }
            }

        rule execfile() -> Statement
            = "EXECFILE"i _ path:string_literal() _ { Statement::ExecFile { path } }

        rule quit() -> Statement
            = "QUIT"i _ { Statement::Quit }
            / "EXIT"i _ { Statement::Quit }

        pub rule statement() -> Statement
            = _ s:(create_table() / drop_table() / create_index() / drop_index() / insert() / select() / delete() / execfile() / quit()) ";"? _ { s }
    }
}

pub fn parse(line: &str) -> Result<Statement> {
    sql::statement(line).map_err(|e| Error::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_create_table() {
        let stmt = parse("CREATE TABLE t (id INTEGER PRIMARY, name CHAR(16))").unwrap();
        assert!(matches!(stmt, Statement::CreateTable { .. }));
    }

    #[test]
    fn parses_select_with_where() {
        let stmt = parse("SELECT id FROM t WHERE g = 1").unwrap();
        match stmt {
            Statement::Select { columns, table, condition } => {
                assert_eq!(columns, vec!["id".to_string()]);
                assert_eq!(table, "t");
                assert!(condition.is_some());
            }
            _ => panic!("wrong statement kind"),
        }
    }

    #[test]
    fn parses_compound_condition() {
        let stmt = parse("SELECT * FROM t WHERE g >= 0 AND g < 2").unwrap();
        assert!(matches!(stmt, Statement::Select { .. }));
    }

    #[test]
    fn parses_insert_with_multiple_rows() {
        let stmt = parse("INSERT INTO t VALUES (1, 'a'), (2, 'b')").unwrap();
        match stmt {
            Statement::Insert { rows, .. } => assert_eq!(rows.len(), 2),
            _ => panic!("wrong statement kind"),
        }
    }
}
