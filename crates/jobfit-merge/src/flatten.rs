use jobfit_core::{MasterMapping, RoleRow, SortedByCompany, MIN_REPORT_SCORE};

/// Turn the master mapping into per-company rows, dropping anything without a
/// score or below [`MIN_REPORT_SCORE`]. Every company keeps its slot, even
/// when no row survives. The sort is stable in both directions.
pub fn flatten_and_sort(master: &MasterMapping, descending: bool) -> SortedByCompany {
    let mut sorted = SortedByCompany::with_capacity(master.len());
    for (company, roles) in master {
        let mut rows = roles
            .iter()
            .filter_map(|(role, record)| {
                let score = record.parsed_score()?;
                (score >= MIN_REPORT_SCORE).then(|| RoleRow::from_record(company, role, score, record))
            })
            .collect::<Vec<_>>();
        if descending {
            rows.sort_by(|a, b| b.score.total_cmp(&a.score));
        } else {
            rows.sort_by(|a, b| a.score.total_cmp(&b.score));
        }
        sorted.insert(company.clone(), rows);
    }
    sorted
}

pub fn count_rows(sorted: &SortedByCompany) -> usize {
    sorted.values().map(Vec::len).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobfit_core::{JobRecord, RoleMap};
    use serde_json::json;

    fn master(entries: &[(&str, &str, serde_json::Value)]) -> MasterMapping {
        let mut master = MasterMapping::new();
        for (company, role, detail) in entries {
            master
                .entry(company.to_string())
                .or_insert_with(RoleMap::new)
                .insert(role.to_string(), JobRecord::from_json_value(detail.clone()).unwrap());
        }
        master
    }

    #[test]
    fn drops_low_and_missing_scores() {
        let m = master(&[
            ("Acme", "A", json!({"score": 95})),
            ("Acme", "B", json!({"score": 60})),
            ("Acme", "C", json!({"score": "99"})),
            ("Acme", "D", json!({"fit_reason": "no score"})),
            ("Acme", "E", json!({"score": 80})),
        ]);
        let sorted = flatten_and_sort(&m, true);
        let scores: Vec<_> = sorted["Acme"].iter().map(|r| r.score).collect();
        assert_eq!(scores, vec![99.0, 95.0, 80.0]);
        assert_eq!(count_rows(&sorted), 3);
    }

    #[test]
    fn ties_keep_master_order_in_both_directions() {
        let m = master(&[
            ("Acme", "first", json!({"score": 85})),
            ("Acme", "second", json!({"score": 85})),
            ("Acme", "top", json!({"score": 90})),
        ]);
        let desc: Vec<_> = flatten_and_sort(&m, true)["Acme"]
            .iter()
            .map(|r| r.role_name.clone())
            .collect();
        let asc: Vec<_> = flatten_and_sort(&m, false)["Acme"]
            .iter()
            .map(|r| r.role_name.clone())
            .collect();
        assert_eq!(desc, vec!["top", "first", "second"]);
        assert_eq!(asc, vec!["first", "second", "top"]);
    }

    #[test]
    fn companies_without_passing_rows_stay_listed() {
        let m = master(&[
            ("Low Co", "A", json!({"score": 10})),
            ("Acme", "B", json!({"score": 88})),
        ]);
        let sorted = flatten_and_sort(&m, true);
        assert_eq!(sorted.keys().collect::<Vec<_>>(), vec!["Low Co", "Acme"]);
        assert!(sorted["Low Co"].is_empty());
    }
}
