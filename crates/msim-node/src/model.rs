//! Demo life-cycle model: deterministic output from the demo parameters.
//!
//! Output depends only on the parameters and the sub-value id, so two runs
//! of the same working set produce the same digest.

use msim_run::{Result, SubValueContext, Worker};
use msim_types::ValueKind;

/// Age groups of the `incomeByAge` table.
const AGE_GROUPS: usize = 4;
const PERSONS: f64 = 1000.0;

pub struct LifeCycle;

impl Worker for LifeCycle {
    fn run_sub_value(&self, ctx: &SubValueContext) -> Result<()> {
        let start_age = ctx.read_parameter("StartAge", ValueKind::Int, 1)?;
        let mortality = ctx.read_parameter("MortalityRate", ValueKind::Float, 2)?;
        let use_tax = ctx.read_parameter("UseTax", ValueKind::Bool, 1)?;

        let start_age = start_age.as_ints().and_then(|v| v.first().copied()).ok_or_else(|| ctx.fail("StartAge"))?;
        let mortality = mortality.as_floats().ok_or_else(|| ctx.fail("MortalityRate"))?;
        let use_tax = use_tax.as_bools().and_then(|v| v.first().copied()).ok_or_else(|| ctx.fail("UseTax"))?;

        let (income, persons, deaths) = simulate(start_age, mortality, use_tax, ctx.sub_value_id);
        ctx.report_progress(1, 50.0);
        ctx.write_accumulators(false, "incomeByAge", &[income, persons])?;
        ctx.report_progress(2, 100.0);
        ctx.write_accumulators(true, "deaths", &[deaths])
    }
}

/// Income and survivors per age group, deaths per sex.
fn simulate(start_age: i64, mortality: &[f64], use_tax: bool, sub_value_id: usize) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let tax = if use_tax { 0.8 } else { 1.0 };
    let spread = 1.0 + sub_value_id as f64 * 0.01;
    let rate = mortality.iter().sum::<f64>() / mortality.len().max(1) as f64;

    let mut alive = PERSONS;
    let mut income = Vec::with_capacity(AGE_GROUPS);
    let mut persons = Vec::with_capacity(AGE_GROUPS);
    for group in 0..AGE_GROUPS {
        let age = start_age as f64 + 10.0 * group as f64;
        income.push(age * 1000.0 * tax * spread);
        persons.push(alive);
        alive *= 1.0 - rate;
    }
    let deaths = mortality.iter().map(|m| (PERSONS * m * spread).round()).collect();
    (income, persons, deaths)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_shape_matches_demo_tables() {
        let (income, persons, deaths) = simulate(20, &[0.01, 0.03], true, 0);
        assert_eq!(income.len(), AGE_GROUPS);
        assert_eq!(persons.len(), AGE_GROUPS);
        assert_eq!(deaths, vec![10.0, 30.0]);
        assert_eq!(income[0], 16_000.0);
        assert_eq!(persons[0], PERSONS);
        assert!(persons[3] < persons[0]);
    }

    #[test]
    fn deterministic_per_sub_value() {
        assert_eq!(simulate(20, &[0.01, 0.02], false, 3), simulate(20, &[0.01, 0.02], false, 3));
        assert_ne!(simulate(20, &[0.01, 0.02], false, 3).0, simulate(20, &[0.01, 0.02], false, 4).0);
    }
}
