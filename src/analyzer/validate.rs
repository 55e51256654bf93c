use std::collections::BTreeSet;

use super::types::{Decision, DecompositionPlan};
use crate::errors::ValidationError;

pub const MIN_SUB_ISSUES: usize = 2;
pub const MAX_SUB_ISSUES: usize = 5;

/// Reject plans that cannot be acted on. Errors here are final; the plan
/// is never patched up.
pub fn validate(plan: &DecompositionPlan) -> Result<(), ValidationError> {
    if !(0.0..=1.0).contains(&plan.confidence) {
        return Err(ValidationError::ConfidenceOutOfRange(plan.confidence));
    }

    match plan.decision {
        Decision::Atomic => {
            if !plan.sub_issues.is_empty() {
                return Err(ValidationError::AtomicWithSubIssues {
                    count: plan.sub_issues.len(),
                });
            }
            Ok(())
        }
        Decision::Decompose => {
            let count = plan.sub_issues.len();
            if !(MIN_SUB_ISSUES..=MAX_SUB_ISSUES).contains(&count) {
                return Err(ValidationError::SubIssueCount {
                    count,
                    min: MIN_SUB_ISSUES,
                    max: MAX_SUB_ISSUES,
                });
            }
            for (index, sub) in plan.sub_issues.iter().enumerate() {
                if sub.title.trim().is_empty() {
                    return Err(ValidationError::MissingField {
                        index,
                        field: "title",
                    });
                }
                for &dependency in &sub.depends_on {
                    if dependency >= count {
                        return Err(ValidationError::DependencyOutOfRange { index, dependency });
                    }
                    if dependency == index {
                        return Err(ValidationError::SelfDependency { index });
                    }
                }
            }
            creation_order(plan).map(|_| ())
        }
    }
}

/// Kahn topological order over `depends_on`, ties broken by lowest index.
///
/// Assumes indices are in range; `validate` checks that first.
pub fn creation_order(plan: &DecompositionPlan) -> Result<Vec<usize>, ValidationError> {
    let count = plan.sub_issues.len();
    // Duplicate entries in depends_on count once
    let deps: Vec<BTreeSet<usize>> = plan
        .sub_issues
        .iter()
        .map(|sub| sub.depends_on.iter().copied().filter(|&d| d < count).collect())
        .collect();

    let mut remaining: Vec<usize> = deps.iter().map(|d| d.len()).collect();
    let mut ready: BTreeSet<usize> = (0..count).filter(|&i| remaining[i] == 0).collect();
    let mut order = Vec::with_capacity(count);

    while let Some(next) = ready.pop_first() {
        order.push(next);
        for (i, d) in deps.iter().enumerate() {
            if d.contains(&next) {
                remaining[i] -= 1;
                if remaining[i] == 0 {
                    ready.insert(i);
                }
            }
        }
    }

    if order.len() < count {
        let members = (0..count).filter(|i| !order.contains(i)).collect();
        return Err(ValidationError::Cycle { members });
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::types::SubIssueSpec;

    fn sub(title: &str, depends_on: Vec<usize>) -> SubIssueSpec {
        SubIssueSpec {
            title: title.to_string(),
            body: String::new(),
            labels: vec![],
            depends_on,
        }
    }

    fn decompose(subs: Vec<SubIssueSpec>) -> DecompositionPlan {
        DecompositionPlan {
            decision: Decision::Decompose,
            confidence: 0.8,
            reasoning: "split".to_string(),
            sub_issues: subs,
        }
    }

    #[test]
    fn test_valid_decomposition() {
        let plan = decompose(vec![sub("a", vec![]), sub("b", vec![0]), sub("c", vec![0, 1])]);
        assert_eq!(validate(&plan), Ok(()));
    }

    #[test]
    fn test_valid_atomic() {
        let plan = DecompositionPlan {
            decision: Decision::Atomic,
            confidence: 0.9,
            reasoning: String::new(),
            sub_issues: vec![],
        };
        assert_eq!(validate(&plan), Ok(()));
    }

    #[test]
    fn test_atomic_with_sub_issues_rejected() {
        let mut plan = decompose(vec![sub("a", vec![])]);
        plan.decision = Decision::Atomic;
        assert_eq!(
            validate(&plan),
            Err(ValidationError::AtomicWithSubIssues { count: 1 })
        );
    }

    #[test]
    fn test_confidence_bounds() {
        let mut plan = decompose(vec![sub("a", vec![]), sub("b", vec![])]);
        plan.confidence = 1.5;
        assert_eq!(validate(&plan), Err(ValidationError::ConfidenceOutOfRange(1.5)));
        plan.confidence = -0.1;
        assert!(matches!(
            validate(&plan),
            Err(ValidationError::ConfidenceOutOfRange(_))
        ));
        plan.confidence = 1.0;
        assert_eq!(validate(&plan), Ok(()));
        plan.confidence = f64::NAN;
        assert!(validate(&plan).is_err());
    }

    #[test]
    fn test_sub_issue_count_bounds() {
        let one = decompose(vec![sub("a", vec![])]);
        assert_eq!(
            validate(&one),
            Err(ValidationError::SubIssueCount {
                count: 1,
                min: 2,
                max: 5
            })
        );
        let six = decompose((0..6).map(|i| sub(&format!("s{}", i), vec![])).collect());
        assert!(matches!(
            validate(&six),
            Err(ValidationError::SubIssueCount { count: 6, .. })
        ));
        let five = decompose((0..5).map(|i| sub(&format!("s{}", i), vec![])).collect());
        assert_eq!(validate(&five), Ok(()));
    }

    #[test]
    fn test_empty_title_rejected() {
        let plan = decompose(vec![sub("a", vec![]), sub("  ", vec![])]);
        assert_eq!(
            validate(&plan),
            Err(ValidationError::MissingField {
                index: 1,
                field: "title"
            })
        );
    }

    #[test]
    fn test_dependency_out_of_range() {
        let plan = decompose(vec![sub("a", vec![]), sub("b", vec![7])]);
        assert_eq!(
            validate(&plan),
            Err(ValidationError::DependencyOutOfRange {
                index: 1,
                dependency: 7
            })
        );
    }

    #[test]
    fn test_self_dependency() {
        let plan = decompose(vec![sub("a", vec![0]), sub("b", vec![])]);
        assert_eq!(validate(&plan), Err(ValidationError::SelfDependency { index: 0 }));
    }

    #[test]
    fn test_cycle_detected() {
        let plan = decompose(vec![sub("a", vec![2]), sub("b", vec![0]), sub("c", vec![1]), sub("d", vec![])]);
        assert_eq!(
            validate(&plan),
            Err(ValidationError::Cycle {
                members: vec![0, 1, 2]
            })
        );
    }

    #[test]
    fn test_creation_order_ties_by_index() {
        let plan = decompose(vec![
            sub("a", vec![2]),
            sub("b", vec![]),
            sub("c", vec![]),
            sub("d", vec![0, 0]),
        ]);
        assert_eq!(creation_order(&plan).unwrap(), vec![1, 2, 0, 3]);
    }
}
