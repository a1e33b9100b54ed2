use serde::{Deserialize, Serialize};

use crate::{db::models::Phase, error::ValidationError};

use super::normalize::{default_phases, normalize_phases, UNTITLED_PHASE_COLOR, UNTITLED_PHASE_NAME};

/// Field changes for one phase. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PhaseChanges {
    pub name: Option<String>,
    pub color: Option<String>,
    pub shortcut: Option<char>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PhaseEdit {
    Replace(Vec<Phase>),
    /// Phase ids in their new order; ids left out keep their relative
    /// order after the listed ones.
    Reorder(Vec<String>),
    Update { id: String, changes: PhaseChanges },
    Add(PhaseChanges),
    Remove(String),
    ResetToDefault,
}

pub fn apply_edit(phases: &[Phase], edit: PhaseEdit) -> Result<Vec<Phase>, ValidationError> {
    let next = match edit {
        PhaseEdit::Replace(replacement) => replacement,
        PhaseEdit::Reorder(ids) => {
            let mut remaining = phases.to_vec();
            let mut ordered = Vec::with_capacity(remaining.len());
            for id in &ids {
                if let Some(position) = remaining.iter().position(|phase| &phase.id == id) {
                    ordered.push(remaining.remove(position));
                }
            }
            ordered.extend(remaining);
            ordered
                .into_iter()
                .enumerate()
                .map(|(order, phase)| Phase {
                    order: Some(order),
                    ..phase
                })
                .collect()
        }
        PhaseEdit::Update { id, changes } => {
            if !phases.iter().any(|phase| phase.id == id) {
                return Err(ValidationError::PhaseNotFound(id));
            }
            let mut updated = phases.to_vec();
            for phase in updated.iter_mut().filter(|phase| phase.id == id) {
                if let Some(name) = &changes.name {
                    phase.name = name.clone();
                }
                if let Some(color) = &changes.color {
                    phase.color = color.clone();
                }
                if changes.shortcut.is_some() {
                    phase.shortcut = changes.shortcut;
                }
            }
            // A claimed key is taken from whichever other phase held it.
            if let Some(key) = changes.shortcut {
                for phase in updated.iter_mut().filter(|phase| phase.id != id) {
                    if phase.shortcut == Some(key) {
                        phase.shortcut = None;
                    }
                }
            }
            updated
        }
        PhaseEdit::Add(changes) => {
            let mut extended = phases.to_vec();
            extended.push(Phase {
                id: String::new(),
                name: changes.name.unwrap_or_else(|| UNTITLED_PHASE_NAME.to_string()),
                color: changes
                    .color
                    .unwrap_or_else(|| UNTITLED_PHASE_COLOR.to_string()),
                shortcut: changes.shortcut,
                order: Some(phases.len()),
            });
            extended
        }
        PhaseEdit::Remove(id) => {
            if !phases.iter().any(|phase| phase.id == id) {
                return Err(ValidationError::PhaseNotFound(id));
            }
            phases.iter().filter(|phase| phase.id != id).cloned().collect()
        }
        PhaseEdit::ResetToDefault => return Ok(default_phases()),
    };

    Ok(normalize_phases(next))
}

/// Where the current phase index lands after `before` became `after`:
/// on the same phase id when it survived, else clamped into range.
pub fn follow_phase(before: &[Phase], after: &[Phase], current: usize) -> usize {
    before
        .get(current)
        .and_then(|selected| after.iter().position(|phase| phase.id == selected.id))
        .unwrap_or_else(|| current.min(after.len().saturating_sub(1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reorder_moves_listed_ids_first() {
        let phases = default_phases();
        let next = apply_edit(
            &phases,
            PhaseEdit::Reorder(vec!["impact".into(), "baseline".into()]),
        )
        .unwrap();
        let ids: Vec<_> = next.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["impact", "baseline", "approach", "ringdown"]);
        assert_eq!(next[0].order, Some(0));
        // Shortcuts travel with their phase.
        assert_eq!(next[0].shortcut, Some('3'));
    }

    #[test]
    fn update_steals_shortcut_from_previous_holder() {
        let phases = default_phases();
        let next = apply_edit(
            &phases,
            PhaseEdit::Update {
                id: "ringdown".into(),
                changes: PhaseChanges {
                    shortcut: Some('1'),
                    color: Some("#ffffff".into()),
                    ..Default::default()
                },
            },
        )
        .unwrap();
        assert_eq!(next[3].shortcut, Some('1'));
        assert_eq!(next[3].color, "#FFFFFF");
        assert_eq!(next[0].shortcut, Some('4'));
    }

    #[test]
    fn add_uses_placeholder_fields() {
        let next = apply_edit(&default_phases(), PhaseEdit::Add(PhaseChanges::default())).unwrap();
        assert_eq!(next.len(), 5);
        assert_eq!(next[4].name, UNTITLED_PHASE_NAME);
        assert_eq!(next[4].shortcut, Some('5'));
        assert_eq!(next[4].order, Some(4));
    }

    #[test]
    fn remove_unknown_phase_is_rejected() {
        let result = apply_edit(&default_phases(), PhaseEdit::Remove("nope".into()));
        assert_eq!(result, Err(ValidationError::PhaseNotFound("nope".into())));
    }

    #[test]
    fn selection_follows_phase_id() {
        let before = default_phases();
        let after = apply_edit(&before, PhaseEdit::Remove("baseline".into())).unwrap();
        assert_eq!(follow_phase(&before, &after, 2), 1);
        // Removed selection falls back to a clamped index.
        assert_eq!(follow_phase(&before, &after, 0), 0);
        assert_eq!(follow_phase(&before, &[], 3), 0);
    }
}
