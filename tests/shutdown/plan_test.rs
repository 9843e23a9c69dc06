/*!
 * Shutdown Plan Tests
 * Property checks over randomly generated hook graphs
 */

use ai_os_lifecycle::shutdown::ShutdownPlan;
use ai_os_lifecycle::{HookPriority, ShutdownHook};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::collections::HashMap;

fn noop(name: String, priority: HookPriority, depends_on: Vec<String>) -> ShutdownHook {
    ShutdownHook::new(name, priority, || async { Ok(()) }).depends_on_all(depends_on)
}

/// Acyclic hook graphs with no priority inversions
///
/// Hook `i` may only depend on hooks `j < i` whose tier is not later than its own.
fn valid_graph() -> impl Strategy<Value = Vec<ShutdownHook>> {
    (1usize..14)
        .prop_flat_map(|n| {
            (
                prop::collection::vec(0usize..HookPriority::ALL.len(), n),
                prop::collection::vec(prop::collection::vec(any::<bool>(), n), n),
            )
        })
        .prop_map(|(tiers, edges)| {
            let n = tiers.len();
            (0..n)
                .map(|i| {
                    let depends_on = (0..i)
                        .filter(|&j| edges[i][j] && tiers[j] <= tiers[i])
                        .map(|j| format!("hook-{}", j))
                        .collect();
                    noop(format!("hook-{}", i), HookPriority::ALL[tiers[i]], depends_on)
                })
                .collect()
        })
}

proptest! {
    #[test]
    fn prop_execution_order_respects_dependencies(hooks in valid_graph()) {
        let plan = ShutdownPlan::build(&hooks);
        let order = plan.execution_order();

        prop_assert!(plan.warnings.is_empty());
        prop_assert!(plan.deferred().is_empty());
        prop_assert_eq!(order.len(), hooks.len());

        let position: HashMap<&str, usize> =
            order.iter().enumerate().map(|(i, name)| (name.as_str(), i)).collect();
        prop_assert_eq!(position.len(), hooks.len());

        for hook in &hooks {
            for dep in hook.dependencies() {
                prop_assert!(position[dep.as_str()] < position[hook.name()]);
            }
        }

        let priorities: HashMap<&str, HookPriority> =
            hooks.iter().map(|h| (h.name(), h.priority())).collect();
        for pair in order.windows(2) {
            prop_assert!(priorities[pair[0].as_str()] <= priorities[pair[1].as_str()]);
        }
    }
}

#[test]
fn test_stages_follow_tiers() {
    let hooks = vec![
        noop("flush".into(), HookPriority::Cleanup, vec![]),
        noop("drain".into(), HookPriority::Critical, vec![]),
        noop("close".into(), HookPriority::Critical, vec!["drain".into()]),
    ];
    let plan = ShutdownPlan::build(&hooks);

    let tiers: Vec<_> = plan.stages.iter().map(|s| s.priority).collect();
    assert_eq!(
        tiers,
        vec![Some(HookPriority::Critical), Some(HookPriority::Cleanup)]
    );
    assert_eq!(plan.execution_order(), vec!["drain", "close", "flush"]);
}

#[test]
fn test_forward_reference_to_missing_hook_is_dropped() {
    let hooks = vec![noop(
        "close".into(),
        HookPriority::Normal,
        vec!["never-registered".into()],
    )];
    let plan = ShutdownPlan::build(&hooks);

    assert_eq!(plan.execution_order(), vec!["close"]);
    assert_eq!(plan.warnings.len(), 1);
    assert!(plan.warnings[0].contains("never-registered"));
}
