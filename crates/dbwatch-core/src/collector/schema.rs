//! Structural metadata of user schemas.
//!
//! Emits the current shape only; detecting changes between snapshots is
//! left to the ingestion side.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use super::{Collector, EntitySamples};
use crate::error::CollectError;
use crate::model::RawSample;
use crate::source::DatabaseSource;

pub struct SchemaMonitorCollector {
    name: String,
    source: Arc<dyn DatabaseSource>,
}

impl SchemaMonitorCollector {
    pub fn new(name: impl Into<String>, source: Arc<dyn DatabaseSource>) -> Self {
        Self {
            name: name.into(),
            source,
        }
    }
}

#[async_trait]
impl Collector for SchemaMonitorCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn sample(&self) -> Result<Vec<RawSample>, CollectError> {
        let schema = self.source.schema().await?;

        let captured_at = Utc::now();
        let columns: usize = schema.tables.iter().map(|t| t.columns.len()).sum();
        let mut out = Vec::with_capacity(schema.tables.len() + columns + schema.indexes.len());

        for table in &schema.tables {
            let table_key = format!("{}.{}", table.schema, table.name);
            EntitySamples::new(&mut out, format!("table:{table_key}"), captured_at)
                .dimension("schema", table.schema.as_str())
                .dimension("table", table.name.as_str())
                .gauge("schema_table_columns", table.columns.len() as f64, "count");

            for column in &table.columns {
                EntitySamples::new(
                    &mut out,
                    format!("column:{table_key}.{}", column.name),
                    captured_at,
                )
                .dimension("schema", table.schema.as_str())
                .dimension("table", table.name.as_str())
                .dimension("column", column.name.as_str())
                .dimension("data_type", column.data_type.as_str())
                .dimension("nullable", column.nullable.to_string())
                .gauge("schema_column", f64::from(column.ordinal), "position");
            }
        }

        for index in &schema.indexes {
            EntitySamples::new(
                &mut out,
                format!("index:{}.{}", index.schema, index.name),
                captured_at,
            )
            .dimension("schema", index.schema.as_str())
            .dimension("table", index.table.as_str())
            .dimension("index", index.name.as_str())
            .dimension("unique", index.is_unique.to_string())
            .dimension("primary", index.is_primary.to_string())
            .gauge("schema_index", 1.0, "count");
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SampleKind;
    use crate::source::mock::MockDatabase;
    use crate::source::{ColumnDef, IndexDef, SchemaSnapshot, TableDef};

    #[tokio::test]
    async fn emits_table_column_and_index_gauges() {
        let db = MockDatabase::new();
        db.set_schema(SchemaSnapshot {
            tables: vec![TableDef {
                schema: "public".into(),
                name: "users".into(),
                columns: vec![
                    ColumnDef {
                        name: "id".into(),
                        data_type: "bigint".into(),
                        nullable: false,
                        ordinal: 1,
                    },
                    ColumnDef {
                        name: "email".into(),
                        data_type: "text".into(),
                        nullable: true,
                        ordinal: 2,
                    },
                ],
            }],
            indexes: vec![IndexDef {
                schema: "public".into(),
                table: "users".into(),
                name: "users_pkey".into(),
                is_unique: true,
                is_primary: true,
            }],
        });

        let collector = SchemaMonitorCollector::new("schema_monitor", Arc::new(db));
        let samples = collector.sample().await.unwrap();

        assert_eq!(samples.len(), 4);
        assert!(samples.iter().all(|s| s.kind == SampleKind::Gauge));
        assert_eq!(samples[0].metric_name, "schema_table_columns");
        assert_eq!(samples[0].raw_value, 2.0);
        assert_eq!(samples[2].entity_key, "column:public.users.email");
        assert_eq!(
            samples[2].dimensions.get("nullable").map(String::as_str),
            Some("true")
        );
        assert_eq!(samples[3].metric_name, "schema_index");
        assert_eq!(
            samples[3].dimensions.get("primary").map(String::as_str),
            Some("true")
        );
    }
}
