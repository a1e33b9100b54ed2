use std::collections::HashSet;

use uuid::Uuid;

use crate::db::models::Phase;

/// Keys a phase shortcut may be bound to.
pub const SHORTCUT_POOL: [char; 9] = ['1', '2', '3', '4', '5', '6', '7', '8', '9'];

pub const UNTITLED_PHASE_NAME: &str = "Untitled phase";
pub const UNTITLED_PHASE_COLOR: &str = "#94A3B8";

pub fn default_phases() -> Vec<Phase> {
    normalize_phases(vec![
        Phase::new("baseline", "Baseline", "#38BDF8", '1', 0),
        Phase::new("approach", "Approach", "#A855F7", '2', 1),
        Phase::new("impact", "Impact", "#F97316", '3', 2),
        Phase::new("ringdown", "Ringdown", "#FACC15", '4', 3),
    ])
}

fn pool_shortcut(shortcut: Option<char>) -> Option<char> {
    shortcut.filter(|c| SHORTCUT_POOL.contains(c))
}

/// Brings an arbitrary phase list into canonical form:
///
/// * every phase has an id (`phase-<uuid>` when missing),
/// * order is contiguous from 0, following the declared `order` and
///   falling back to input position,
/// * colors are trimmed and upper-cased,
/// * shortcuts are unique pool keys; the first claimant keeps a duplicate
///   and phases without a key receive the lowest unused one.
pub fn normalize_phases(phases: Vec<Phase>) -> Vec<Phase> {
    let mut ranked: Vec<(usize, Phase)> = phases
        .into_iter()
        .enumerate()
        .map(|(position, mut phase)| {
            if phase.id.trim().is_empty() {
                phase.id = format!("phase-{}", Uuid::new_v4());
            }
            (phase.order.unwrap_or(position), phase)
        })
        .collect();
    // Stable, so equal ranks keep input order.
    ranked.sort_by_key(|(rank, _)| *rank);

    let mut used = HashSet::new();
    let mut normalized: Vec<Phase> = ranked
        .into_iter()
        .enumerate()
        .map(|(order, (_, phase))| {
            let shortcut = pool_shortcut(phase.shortcut).filter(|c| used.insert(*c));
            Phase {
                order: Some(order),
                color: phase.color.trim().to_uppercase(),
                shortcut,
                ..phase
            }
        })
        .collect();

    for phase in normalized.iter_mut().filter(|phase| phase.shortcut.is_none()) {
        if let Some(free) = SHORTCUT_POOL.iter().copied().find(|c| !used.contains(c)) {
            used.insert(free);
            phase.shortcut = Some(free);
        }
    }

    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare(name: &str, color: &str, shortcut: Option<char>, order: Option<usize>) -> Phase {
        Phase {
            id: String::new(),
            name: name.into(),
            color: color.into(),
            shortcut,
            order,
        }
    }

    #[test]
    fn default_template_is_already_canonical() {
        let phases = default_phases();
        let names: Vec<_> = phases.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["Baseline", "Approach", "Impact", "Ringdown"]);
        assert_eq!(phases[2].shortcut, Some('3'));
        assert_eq!(normalize_phases(phases.clone()), phases);
    }

    #[test]
    fn assigns_ids_and_upper_cases_colors() {
        let phases = normalize_phases(vec![bare("A", " #abcdef ", Some('1'), None)]);
        assert!(phases[0].id.starts_with("phase-"));
        assert_eq!(phases[0].color, "#ABCDEF");
    }

    #[test]
    fn sorts_by_declared_order_and_compacts_it() {
        let phases = normalize_phases(vec![
            bare("late", "#000000", None, Some(7)),
            bare("early", "#000000", None, Some(2)),
        ]);
        assert_eq!(phases[0].name, "early");
        assert_eq!(phases[0].order, Some(0));
        assert_eq!(phases[1].order, Some(1));
    }

    #[test]
    fn duplicate_and_foreign_shortcuts_are_reassigned() {
        let phases = normalize_phases(vec![
            bare("a", "#000000", Some('2'), None),
            bare("b", "#000000", Some('2'), None),
            bare("c", "#000000", Some('x'), None),
        ]);
        let keys: Vec<_> = phases.iter().map(|p| p.shortcut).collect();
        assert_eq!(keys, [Some('2'), Some('1'), Some('3')]);
    }

    #[test]
    fn pool_exhaustion_leaves_shortcut_empty() {
        let many = (0..10)
            .map(|i| bare(&format!("p{i}"), "#000000", None, None))
            .collect();
        let phases = normalize_phases(many);
        assert_eq!(phases[8].shortcut, Some('9'));
        assert_eq!(phases[9].shortcut, None);
    }
}
