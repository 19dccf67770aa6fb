//! Template rules: fields whose values are generated (names, checksums) get
//! the existing value substituted so they never count as a diff.

use berth_config::TemplateRule;
use berth_core::Resource;

use crate::DiffError;

/// Returns a copy of `new` with each declared field masked by the existing
/// value, when both resources carry the field.
pub fn apply_template_rules(
    new: &Resource,
    existing: &Resource,
    rules: &[TemplateRule],
) -> Result<Resource, DiffError> {
    let mut target = new.deep_copy();
    for rule in rules {
        if !rule.matches(&target) {
            continue;
        }
        for path in &rule.paths {
            if target.get(path).is_none() || existing.get(path).is_none() {
                continue;
            }
            target.copy_from(existing, path).map_err(|e| DiffError::RebaseFailed {
                resource: new.description(),
                source: e,
            })?;
        }
    }
    Ok(target)
}
