//! Immutable, already-loaded metadata catalog.
//!
//! The root (or single) process loads it once from the model database and
//! child processes receive a packed copy of it. Nothing mutates it after
//! construction; coordinators share it behind an `Arc`.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TypesError};
use crate::params::ValueKind;
use crate::ModelId;

// ── Dictionary rows ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDic {
    pub model_id: ModelId,
    pub name: String,
    pub digest: String,
}

/// Output table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDic {
    pub table_id: u32,
    pub name: String,
    /// Number of cells in each accumulator of this table.
    pub cell_count: usize,
}

/// One accumulator of an output table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableAcc {
    pub table_id: u32,
    pub acc_id: u32,
    pub name: String,
}

/// How an output expression folds one accumulator across sub-values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Aggregation {
    Mean,
    Sum,
    Min,
    Max,
}

/// Output expression: aggregate of one accumulator over all sub-values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableExpr {
    pub table_id: u32,
    pub expr_id: u32,
    pub name: String,
    pub acc_id: u32,
    pub aggregation: Aggregation,
}

/// Input parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamDic {
    pub param_id: u32,
    pub name: String,
    pub kind: ValueKind,
    /// Number of values in one sub-value of the parameter.
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDic {
    pub entity_id: u32,
    pub name: String,
    pub attributes: Vec<String>,
}

// ── Catalog ───────────────────────────────────────────────────────────────────

/// Decoded catalogs are validated like built ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "CatalogRows")]
pub struct MetadataCatalog {
    model: ModelDic,
    tables: Vec<TableDic>,
    /// Sorted by `(table_id, acc_id)`; the position is the global accumulator index.
    accumulators: Vec<TableAcc>,
    expressions: Vec<TableExpr>,
    parameters: Vec<ParamDic>,
    entities: Vec<EntityDic>,
}

/// Wire and snapshot form of [`MetadataCatalog`], before validation.
#[derive(Deserialize)]
struct CatalogRows {
    model: ModelDic,
    tables: Vec<TableDic>,
    accumulators: Vec<TableAcc>,
    expressions: Vec<TableExpr>,
    parameters: Vec<ParamDic>,
    entities: Vec<EntityDic>,
}

impl TryFrom<CatalogRows> for MetadataCatalog {
    type Error = TypesError;

    fn try_from(rows: CatalogRows) -> Result<Self> {
        Self::new(rows.model, rows.tables, rows.accumulators, rows.expressions, rows.parameters, rows.entities)
    }
}

impl MetadataCatalog {
    /// Validate and index the dictionary rows.
    pub fn new(
        model: ModelDic,
        mut tables: Vec<TableDic>,
        mut accumulators: Vec<TableAcc>,
        expressions: Vec<TableExpr>,
        parameters: Vec<ParamDic>,
        entities: Vec<EntityDic>,
    ) -> Result<Self> {
        tables.sort_by_key(|t| t.table_id);
        accumulators.sort_by_key(|a| (a.table_id, a.acc_id));

        for pair in tables.windows(2) {
            if pair[0].table_id == pair[1].table_id {
                return Err(TypesError::Catalog(format!(
                    "duplicate table id {}",
                    pair[0].table_id
                )));
            }
        }
        for table in &tables {
            if table.cell_count == 0 {
                return Err(TypesError::Catalog(format!("table {} has no cells", table.name)));
            }
            if !accumulators.iter().any(|a| a.table_id == table.table_id) {
                return Err(TypesError::Catalog(format!(
                    "table {} has no accumulators",
                    table.name
                )));
            }
        }
        for acc in &accumulators {
            if !tables.iter().any(|t| t.table_id == acc.table_id) {
                return Err(TypesError::Catalog(format!(
                    "accumulator {} refers to unknown table id {}",
                    acc.name, acc.table_id
                )));
            }
        }
        for expr in &expressions {
            if !accumulators
                .iter()
                .any(|a| a.table_id == expr.table_id && a.acc_id == expr.acc_id)
            {
                return Err(TypesError::Catalog(format!(
                    "expression {} refers to unknown accumulator {} of table {}",
                    expr.name, expr.acc_id, expr.table_id
                )));
            }
        }
        for param in &parameters {
            if param.size == 0 {
                return Err(TypesError::Catalog(format!("parameter {} has zero size", param.name)));
            }
        }

        Ok(Self { model, tables, accumulators, expressions, parameters, entities })
    }

    pub fn model(&self) -> &ModelDic {
        &self.model
    }

    pub fn model_id(&self) -> ModelId {
        self.model.model_id
    }

    /// All output tables of the model, ordered by table id.
    pub fn table_dic_by_model_id(&self, model_id: ModelId) -> &[TableDic] {
        if model_id == self.model.model_id {
            &self.tables
        } else {
            &[]
        }
    }

    pub fn tables(&self) -> &[TableDic] {
        &self.tables
    }

    pub fn table_by_id(&self, table_id: u32) -> Option<&TableDic> {
        self.tables.iter().find(|t| t.table_id == table_id)
    }

    pub fn table_by_name(&self, name: &str) -> Option<&TableDic> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Every accumulator of every table, in global accumulator index order.
    pub fn accumulators(&self) -> &[TableAcc] {
        &self.accumulators
    }

    pub fn accumulator_count(&self) -> usize {
        self.accumulators.len()
    }

    /// Accumulators of one table: a contiguous slice of the global list.
    pub fn accumulators_by_table(&self, table_id: u32) -> &[TableAcc] {
        &self.accumulators[self.accumulator_range(table_id)]
    }

    /// Global accumulator index range owned by `table_id` (empty if unknown).
    pub fn accumulator_range(&self, table_id: u32) -> Range<usize> {
        let start = self.accumulators.partition_point(|a| a.table_id < table_id);
        let end = self.accumulators.partition_point(|a| a.table_id <= table_id);
        start..end
    }

    /// Global index of one accumulator, used to address it on the transport.
    pub fn accumulator_index(&self, table_id: u32, acc_id: u32) -> Option<usize> {
        self.accumulators
            .binary_search_by_key(&(table_id, acc_id), |a| (a.table_id, a.acc_id))
            .ok()
    }

    pub fn expressions_by_table(&self, table_id: u32) -> impl Iterator<Item = &TableExpr> {
        self.expressions.iter().filter(move |e| e.table_id == table_id)
    }

    pub fn parameters(&self) -> &[ParamDic] {
        &self.parameters
    }

    pub fn parameter_by_name(&self, name: &str) -> Option<&ParamDic> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn entity_by_key(&self, entity_id: u32) -> Option<&EntityDic> {
        self.entities.iter().find(|e| e.entity_id == entity_id)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
