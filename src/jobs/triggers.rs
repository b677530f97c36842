//! Trigger evaluation and cooldown state
//!
//! The engine keeps the last sampled value per (table, field) and the last
//! fire time per table. Comparison ops evaluate against the threshold even
//! on the very first sample; `change`, `rising` and `falling` need a
//! previous value and stay quiet until one exists.

use crate::models::{Trigger, TriggerOp};
use crate::protocols::Value;
use std::collections::{BTreeMap, HashMap};

/// Outcome of evaluating all of a table's triggers for one tick
#[derive(Debug, Clone, Default)]
pub struct TableEvaluation {
    /// At least one trigger fired (tie-break: any fire means fire)
    pub fired: bool,
    /// A row should be written this tick
    pub write: bool,
    /// A fire was swallowed by a cooldown
    pub suppressed: bool,
    /// Per-trigger fire flags, in input order
    pub per_trigger: Vec<bool>,
}

/// Pure predicate for one trigger against the current and previous values
pub fn trigger_fires(
    op: TriggerOp,
    value: &Value,
    prev: Option<&Value>,
    threshold: Option<f64>,
    deadband: f64,
) -> bool {
    let v = value.as_f64();
    let p = prev.and_then(|p| p.as_f64());
    match op {
        TriggerOp::Change => match (v, p) {
            (Some(v), Some(p)) => (v - p).abs() > deadband,
            // non-numeric change detection falls back to inequality
            _ => match prev {
                Some(prev) => !value.is_null() && value != prev,
                None => false,
            },
        },
        TriggerOp::Gt => matches!((v, threshold), (Some(v), Some(t)) if v > t),
        TriggerOp::Ge => matches!((v, threshold), (Some(v), Some(t)) if v >= t),
        TriggerOp::Lt => matches!((v, threshold), (Some(v), Some(t)) if v < t),
        TriggerOp::Le => matches!((v, threshold), (Some(v), Some(t)) if v <= t),
        TriggerOp::Eq => matches!((v, threshold), (Some(v), Some(t)) if v == t),
        TriggerOp::Ne => matches!((v, threshold), (Some(v), Some(t)) if v != t),
        TriggerOp::Rising => {
            matches!((v, p, threshold), (Some(v), Some(p), Some(t)) if p <= t && v > t)
        }
        TriggerOp::Falling => {
            matches!((v, p, threshold), (Some(v), Some(p), Some(t)) if p >= t && v < t)
        }
    }
}

/// Per-worker trigger state: previous samples and fire times
#[derive(Default)]
pub struct TriggerEngine {
    last_values: HashMap<(String, String), Value>,
    last_fire_ms: HashMap<String, u64>,
}

impl TriggerEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate the given table's triggers against a coherent snapshot.
    /// Last values update for every sampled field whether or not anything
    /// fired; a fire only writes when its cooldown has fully elapsed.
    pub fn evaluate_table(
        &mut self,
        table_id: &str,
        triggers: &[&Trigger],
        snapshot: &BTreeMap<String, Value>,
        now_ms: u64,
    ) -> TableEvaluation {
        let mut eval = TableEvaluation::default();
        let mut actionable = false;

        for trigger in triggers {
            let value = snapshot
                .get(&trigger.field_key)
                .cloned()
                .unwrap_or(Value::Null);
            let prev = self
                .last_values
                .get(&(table_id.to_string(), trigger.field_key.clone()));
            let fired = !value.is_null()
                && trigger_fires(
                    trigger.op,
                    &value,
                    prev,
                    trigger.value,
                    trigger.deadband.unwrap_or(0.0),
                );
            eval.per_trigger.push(fired);
            if fired {
                eval.fired = true;
                let cooldown = trigger.cooldown_ms.unwrap_or(0);
                let elapsed = self
                    .last_fire_ms
                    .get(table_id)
                    .map(|last| now_ms.saturating_sub(*last));
                // first fire ever is always actionable
                if cooldown == 0 || elapsed.map(|e| e > cooldown).unwrap_or(true) {
                    actionable = true;
                }
            }
        }

        // previous values advance regardless of fire decisions
        for (field, value) in snapshot {
            self.last_values
                .insert((table_id.to_string(), field.clone()), value.clone());
        }

        if eval.fired {
            if actionable {
                eval.write = true;
                self.last_fire_ms.insert(table_id.to_string(), now_ms);
            } else {
                eval.suppressed = true;
            }
        }
        eval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Trigger;

    fn trigger(op: TriggerOp, value: Option<f64>, cooldown_ms: Option<u64>) -> Trigger {
        Trigger {
            table_id: "tbl_1".into(),
            field_key: "r_current".into(),
            op,
            value,
            deadband: None,
            cooldown_ms,
        }
    }

    fn snap(v: f64) -> BTreeMap<String, Value> {
        let mut m = BTreeMap::new();
        m.insert("r_current".to_string(), Value::F64(v));
        m
    }

    #[test]
    fn comparison_ops_evaluate_without_prev() {
        assert!(trigger_fires(TriggerOp::Gt, &Value::F64(0.9), None, Some(0.5), 0.0));
        assert!(!trigger_fires(TriggerOp::Gt, &Value::F64(0.4), None, Some(0.5), 0.0));
        assert!(trigger_fires(TriggerOp::Le, &Value::I64(5), None, Some(5.0), 0.0));
        assert!(trigger_fires(TriggerOp::Ne, &Value::F64(1.0), None, Some(2.0), 0.0));
    }

    #[test]
    fn edge_ops_need_prev() {
        assert!(!trigger_fires(TriggerOp::Rising, &Value::F64(1.0), None, Some(0.5), 0.0));
        assert!(trigger_fires(
            TriggerOp::Rising,
            &Value::F64(1.0),
            Some(&Value::F64(0.2)),
            Some(0.5),
            0.0
        ));
        assert!(!trigger_fires(
            TriggerOp::Rising,
            &Value::F64(1.0),
            Some(&Value::F64(0.8)),
            Some(0.5),
            0.0
        ));
        assert!(trigger_fires(
            TriggerOp::Falling,
            &Value::F64(0.2),
            Some(&Value::F64(0.8)),
            Some(0.5),
            0.0
        ));
        assert!(!trigger_fires(TriggerOp::Change, &Value::F64(1.0), None, None, 0.0));
    }

    #[test]
    fn change_respects_deadband() {
        let prev = Value::F64(10.0);
        assert!(!trigger_fires(TriggerOp::Change, &Value::F64(10.4), Some(&prev), None, 0.5));
        assert!(trigger_fires(TriggerOp::Change, &Value::F64(10.6), Some(&prev), None, 0.5));
        // string change falls back to inequality
        assert!(trigger_fires(
            TriggerOp::Change,
            &Value::Str("RUN".into()),
            Some(&Value::Str("STOP".into())),
            None,
            0.0
        ));
    }

    #[test]
    fn cooldown_scenario_writes_first_and_fourth_fire() {
        // values 0.4, 0.9, 0.9, 0.9, 0.2, 0.9 at 1s cadence; > 0.5 with a
        // 2s cooldown writes exactly twice and suppresses twice
        let mut engine = TriggerEngine::new();
        let t = trigger(TriggerOp::Gt, Some(0.5), Some(2000));
        let triggers = vec![&t];
        let series = [0.4, 0.9, 0.9, 0.9, 0.2, 0.9];

        let mut writes = 0;
        let mut suppressed = 0;
        for (i, v) in series.iter().enumerate() {
            let eval = engine.evaluate_table("tbl_1", &triggers, &snap(*v), i as u64 * 1000);
            if eval.write {
                writes += 1;
            }
            if eval.suppressed {
                suppressed += 1;
            }
        }
        assert_eq!(writes, 2);
        assert!(suppressed >= 2);
    }

    #[test]
    fn inter_fire_gap_respects_cooldown() {
        let mut engine = TriggerEngine::new();
        let t = trigger(TriggerOp::Gt, Some(0.5), Some(1500));
        let triggers = vec![&t];
        let mut fire_times: Vec<u64> = Vec::new();
        for ms in (0..10_000).step_by(250) {
            let eval = engine.evaluate_table("tbl_1", &triggers, &snap(0.9), ms);
            if eval.write {
                fire_times.push(ms);
            }
        }
        for pair in fire_times.windows(2) {
            assert!(pair[1] - pair[0] >= 1500);
        }
    }

    #[test]
    fn any_fire_means_fire_but_one_row() {
        let mut engine = TriggerEngine::new();
        let a = trigger(TriggerOp::Gt, Some(0.5), None);
        let mut b = trigger(TriggerOp::Lt, Some(0.1), None);
        b.field_key = "voltage".into();
        let triggers = vec![&a, &b];

        let mut snapshot = snap(0.9);
        snapshot.insert("voltage".to_string(), Value::F64(5.0));
        let eval = engine.evaluate_table("tbl_1", &triggers, &snapshot, 0);
        assert_eq!(eval.per_trigger, vec![true, false]);
        assert!(eval.fired);
        assert!(eval.write);
    }

    #[test]
    fn null_values_never_fire() {
        let mut engine = TriggerEngine::new();
        let t = trigger(TriggerOp::Gt, Some(0.5), None);
        let triggers = vec![&t];
        let mut snapshot = BTreeMap::new();
        snapshot.insert("r_current".to_string(), Value::Null);
        let eval = engine.evaluate_table("tbl_1", &triggers, &snapshot, 0);
        assert!(!eval.fired);
    }

    #[test]
    fn first_tick_comparison_fires_without_prev() {
        let mut engine = TriggerEngine::new();
        let t = trigger(TriggerOp::Gt, Some(0.5), None);
        let triggers = vec![&t];
        let eval = engine.evaluate_table("tbl_1", &triggers, &snap(0.9), 0);
        assert!(eval.write);

        // but a change trigger stays quiet on its first sample
        let mut engine = TriggerEngine::new();
        let t = trigger(TriggerOp::Change, None, None);
        let triggers = vec![&t];
        let eval = engine.evaluate_table("tbl_1", &triggers, &snap(0.9), 0);
        assert!(!eval.fired);
        let eval = engine.evaluate_table("tbl_1", &triggers, &snap(1.9), 1000);
        assert!(eval.fired);
    }
}
