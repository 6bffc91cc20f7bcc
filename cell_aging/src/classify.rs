//! Split one unit's records by test type and drop rows that cannot feed a metric.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::{TestRecord, TestType};

/// Cleaned records of one unit. A `None` series means "no data".
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ClassifiedCycles {
    pub discharge: Option<Vec<TestRecord>>,
    pub charge: Option<Vec<TestRecord>>,
    pub impedance: Option<Vec<TestRecord>>,
}

pub fn classify(records: &[TestRecord]) -> ClassifiedCycles {
    let mut discharge = Vec::new();
    let mut charge = Vec::new();
    let mut impedance = Vec::new();

    for record in records {
        match record.test_type {
            TestType::Discharge if record.capacity.is_some() => discharge.push(record.clone()),
            TestType::Impedance if record.re.is_some() && record.rct.is_some() => {
                impedance.push(record.clone())
            }
            TestType::Charge => charge.push(record.clone()),
            _ => {}
        }
    }

    sort_by_cycle(&mut discharge);
    sort_by_cycle(&mut impedance);

    ClassifiedCycles {
        discharge: non_empty(discharge),
        charge: non_empty(charge),
        impedance: non_empty(impedance),
    }
}

/// Stable ascending sort on `cycle_id`; rows without an id go last.
fn sort_by_cycle(records: &mut [TestRecord]) {
    records.sort_by(|a, b| match (a.cycle_id, b.cycle_id) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}

fn non_empty(records: Vec<TestRecord>) -> Option<Vec<TestRecord>> {
    if records.is_empty() {
        None
    } else {
        Some(records)
    }
}
