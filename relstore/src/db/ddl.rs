use crate::db::models::{ColumnModel, ForeignKeyModel, KeyModel, QualifiedName, ReferentialAction, ValueGenerated};
use crate::db::operations::{MigrationOperation, MigrationPlan};
use crate::db::query::quote_ident;
use crate::db::value::ValueKind;

/// Renders migration operations into provider DDL.
pub trait MigrationSqlGenerator {
    /// Statements for one operation, without terminators.
    fn generate(&self, op: &MigrationOperation) -> Vec<String>;

    /// The whole plan as one script.
    fn script(&self, plan: &MigrationPlan) -> String {
        let mut out = String::new();
        for op in plan.iter() {
            for stmt in self.generate(op) {
                out.push_str(&stmt);
                out.push_str(";\n");
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PgMigrationSqlGenerator;

fn columns_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn referential_action(action: ReferentialAction) -> &'static str {
    match action {
        ReferentialAction::NoAction => "NO ACTION",
        ReferentialAction::Restrict => "RESTRICT",
        ReferentialAction::Cascade => "CASCADE",
        ReferentialAction::SetNull => "SET NULL",
    }
}

impl PgMigrationSqlGenerator {
    /// Store-generated integer keys become identity columns; generated
    /// uuids without an explicit default fall back to `gen_random_uuid()`.
    fn column_definition(column: &ColumnModel) -> String {
        let mut def = format!("{} {}", quote_ident(&column.name), column.store_type);
        if !column.nullable {
            def.push_str(" NOT NULL");
        }
        match (&column.default_sql, column.generated, column.kind) {
            (Some(default), _, _) => {
                def.push_str(" DEFAULT ");
                def.push_str(default);
            }
            (None, ValueGenerated::OnAdd, ValueKind::Int) => {
                def.push_str(" GENERATED BY DEFAULT AS IDENTITY");
            }
            (None, ValueGenerated::Never, _) => {}
            (None, _, ValueKind::Uuid) => def.push_str(" DEFAULT gen_random_uuid()"),
            (None, _, ValueKind::Timestamp) => def.push_str(" DEFAULT now()"),
            (None, _, _) => {}
        }
        def
    }

    fn key_constraint(kind: &str, key: &KeyModel) -> String {
        format!(
            "CONSTRAINT {} {} ({})",
            quote_ident(&key.name),
            kind,
            columns_list(&key.columns)
        )
    }

    fn foreign_key_constraint(fk: &ForeignKeyModel, principal: &QualifiedName) -> String {
        format!(
            "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {}",
            quote_ident(&fk.name),
            columns_list(&fk.columns),
            principal,
            columns_list(&fk.principal_columns),
            referential_action(fk.on_delete)
        )
    }

    fn alter_column(table: &QualifiedName, column: &ColumnModel, old: &ColumnModel) -> Vec<String> {
        let prefix = format!("ALTER TABLE {} ALTER COLUMN {}", table, quote_ident(&column.name));
        let mut stmts = Vec::new();
        if column.store_type != old.store_type {
            stmts.push(format!(
                "{prefix} TYPE {} USING {}::{}",
                column.store_type,
                quote_ident(&column.name),
                column.store_type
            ));
        }
        if column.nullable != old.nullable {
            let action = if column.nullable { "DROP" } else { "SET" };
            stmts.push(format!("{prefix} {action} NOT NULL"));
        }
        let identity = |c: &ColumnModel| {
            c.default_sql.is_none() && c.generated == ValueGenerated::OnAdd && c.kind == ValueKind::Int
        };
        if identity(old) && !identity(column) {
            stmts.push(format!("{prefix} DROP IDENTITY IF EXISTS"));
        }
        if column.default_sql != old.default_sql {
            match &column.default_sql {
                Some(default) => stmts.push(format!("{prefix} SET DEFAULT {default}")),
                None => stmts.push(format!("{prefix} DROP DEFAULT")),
            }
        }
        if identity(column) && !identity(old) {
            stmts.push(format!("{prefix} ADD GENERATED BY DEFAULT AS IDENTITY"));
        }
        stmts
    }
}

impl MigrationSqlGenerator for PgMigrationSqlGenerator {
    fn generate(&self, op: &MigrationOperation) -> Vec<String> {
        match op {
            MigrationOperation::EnsureSchema { name } => {
                vec![format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(name))]
            }
            MigrationOperation::CreateTable { table } => {
                let mut parts: Vec<String> = table.columns.iter().map(Self::column_definition).collect();
                if let Some(pk) = &table.primary_key {
                    parts.push(Self::key_constraint("PRIMARY KEY", pk));
                }
                for key in &table.unique_constraints {
                    parts.push(Self::key_constraint("UNIQUE", key));
                }
                vec![format!(
                    "CREATE TABLE {} (\n    {}\n)",
                    table.qualified_name(),
                    parts.join(",\n    ")
                )]
            }
            MigrationOperation::DropTable { table } => vec![format!("DROP TABLE {table}")],
            MigrationOperation::RenameTable {
                table,
                new_name,
                new_schema,
            } => {
                let mut stmts = Vec::new();
                let mut current = table.clone();
                if new_schema != &table.schema {
                    let schema = new_schema.as_deref().unwrap_or("public");
                    stmts.push(format!("ALTER TABLE {} SET SCHEMA {}", current, quote_ident(schema)));
                    current.schema = Some(schema.to_string());
                }
                if new_name != &table.name {
                    stmts.push(format!("ALTER TABLE {} RENAME TO {}", current, quote_ident(new_name)));
                }
                stmts
            }
            MigrationOperation::AddColumn { table, column } => {
                vec![format!("ALTER TABLE {} ADD COLUMN {}", table, Self::column_definition(column))]
            }
            MigrationOperation::DropColumn { table, name } => {
                vec![format!("ALTER TABLE {} DROP COLUMN {}", table, quote_ident(name))]
            }
            MigrationOperation::AlterColumn { table, column, old } => Self::alter_column(table, column, old),
            MigrationOperation::RenameColumn {
                table,
                name,
                new_name,
            } => vec![format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                table,
                quote_ident(name),
                quote_ident(new_name)
            )],
            MigrationOperation::AddPrimaryKey { table, key } => {
                vec![format!("ALTER TABLE {} ADD {}", table, Self::key_constraint("PRIMARY KEY", key))]
            }
            MigrationOperation::AddUniqueConstraint { table, key } => {
                vec![format!("ALTER TABLE {} ADD {}", table, Self::key_constraint("UNIQUE", key))]
            }
            MigrationOperation::DropPrimaryKey { table, name }
            | MigrationOperation::DropUniqueConstraint { table, name }
            | MigrationOperation::DropForeignKey { table, name } => {
                vec![format!("ALTER TABLE {} DROP CONSTRAINT {}", table, quote_ident(name))]
            }
            MigrationOperation::AddForeignKey {
                table,
                principal,
                foreign_key,
            } => vec![format!(
                "ALTER TABLE {} ADD {}",
                table,
                Self::foreign_key_constraint(foreign_key, principal)
            )],
            MigrationOperation::CreateIndex { table, index } => {
                let unique = if index.unique { "UNIQUE " } else { "" };
                vec![format!(
                    "CREATE {}INDEX {} ON {} ({})",
                    unique,
                    quote_ident(&index.name),
                    table,
                    columns_list(&index.columns)
                )]
            }
            MigrationOperation::DropIndex { table, name } => {
                // indexes live in the table's schema
                let index = QualifiedName {
                    schema: table.schema.clone(),
                    name: name.clone(),
                };
                vec![format!("DROP INDEX {index}")]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::TableModel;

    fn users() -> TableModel {
        TableModel::new("users")
            .column(ColumnModel::new("id", "bigint", ValueKind::Int).generated(ValueGenerated::OnAdd))
            .column(ColumnModel::new("email", "text", ValueKind::Text))
            .column(ColumnModel::new("bio", "text", ValueKind::Text).nullable())
            .primary_key(&["id"])
            .unique("uq_users_email", &["email"])
    }

    #[test]
    fn test_create_table_inlines_keys() {
        let sql = PgMigrationSqlGenerator.generate(&MigrationOperation::CreateTable { table: users() });
        assert_eq!(
            sql,
            vec![
                "CREATE TABLE \"users\" (\n    \"id\" bigint NOT NULL GENERATED BY DEFAULT AS IDENTITY,\n    \
                 \"email\" text NOT NULL,\n    \"bio\" text,\n    \
                 CONSTRAINT \"pk_users\" PRIMARY KEY (\"id\"),\n    \
                 CONSTRAINT \"uq_users_email\" UNIQUE (\"email\")\n)"
                    .to_string()
            ]
        );
    }

    #[test]
    fn test_add_foreign_key() {
        let fk = ForeignKeyModel {
            name: "fk_posts_users".into(),
            columns: vec!["author_id".into()],
            principal_table: "users".into(),
            principal_columns: vec!["id".into()],
            on_delete: ReferentialAction::Cascade,
        };
        let sql = PgMigrationSqlGenerator.generate(&MigrationOperation::AddForeignKey {
            table: QualifiedName::new(Some("blog"), "posts"),
            principal: QualifiedName::new(None, "users"),
            foreign_key: fk,
        });
        assert_eq!(
            sql[0],
            "ALTER TABLE \"blog\".\"posts\" ADD CONSTRAINT \"fk_posts_users\" FOREIGN KEY (\"author_id\") \
             REFERENCES \"users\" (\"id\") ON DELETE CASCADE"
        );
    }

    #[test]
    fn test_alter_column_emits_each_change() {
        let old = ColumnModel::new("age", "int", ValueKind::Int);
        let new = ColumnModel::new("age", "bigint", ValueKind::Int).nullable().default_sql("0");
        let sql = PgMigrationSqlGenerator.generate(&MigrationOperation::AlterColumn {
            table: QualifiedName::new(None, "users"),
            column: new,
            old,
        });
        assert_eq!(
            sql,
            vec![
                "ALTER TABLE \"users\" ALTER COLUMN \"age\" TYPE bigint USING \"age\"::bigint",
                "ALTER TABLE \"users\" ALTER COLUMN \"age\" DROP NOT NULL",
                "ALTER TABLE \"users\" ALTER COLUMN \"age\" SET DEFAULT 0",
            ]
        );
    }

    #[test]
    fn test_rename_table_across_schemas() {
        let sql = PgMigrationSqlGenerator.generate(&MigrationOperation::RenameTable {
            table: QualifiedName::new(None, "users"),
            new_name: "members".into(),
            new_schema: Some("auth".into()),
        });
        assert_eq!(
            sql,
            vec![
                "ALTER TABLE \"users\" SET SCHEMA \"auth\"",
                "ALTER TABLE \"auth\".\"users\" RENAME TO \"members\"",
            ]
        );
    }

    #[test]
    fn test_script_terminates_statements() {
        let plan = MigrationPlan {
            operations: vec![
                crate::db::operations::PlannedOperation::new(MigrationOperation::EnsureSchema {
                    name: "auth".into(),
                }),
                crate::db::operations::PlannedOperation::new(MigrationOperation::DropIndex {
                    table: QualifiedName::new(Some("auth"), "users"),
                    name: "ix_users_email".into(),
                }),
            ],
        };
        assert_eq!(
            PgMigrationSqlGenerator.script(&plan),
            "CREATE SCHEMA IF NOT EXISTS \"auth\";\nDROP INDEX \"auth\".\"ix_users_email\";\n"
        );
    }
}
