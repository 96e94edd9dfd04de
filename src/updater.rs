//! Copy-on-write mutation of settings values.

/// Progressively alters a settings value, cloning it at most once across a
/// whole pipeline of mutations and not at all when every attempted change is
/// a no-op.
///
/// The clone function is explicit so callers decide how deep a copy is; the
/// original value is never touched.
pub struct SettingsUpdater<'a, T> {
    original: &'a T,
    clone_fn: Box<dyn Fn(&T) -> T + 'a>,
    modified: Option<T>,
}

impl<'a, T> SettingsUpdater<'a, T> {
    pub fn new(original: &'a T, clone_fn: impl Fn(&T) -> T + 'a) -> Self {
        Self {
            original,
            clone_fn: Box::new(clone_fn),
            modified: None,
        }
    }

    /// Applies `transform` to the value read by `selector`; when the result
    /// differs, clones the base (first real change only) and writes the new
    /// value through `setter`. Returns whether a change was applied.
    pub fn modify_if_changed<V>(
        &mut self,
        selector: impl Fn(&T) -> V,
        transform: impl Fn(&V) -> V,
        setter: impl Fn(&mut T, V),
    ) -> bool
    where
        V: PartialEq,
    {
        let old_value = selector(self.current());
        let new_value = transform(&old_value);
        if new_value == old_value {
            return false;
        }
        if self.modified.is_none() {
            self.modified = Some((self.clone_fn)(self.original));
        }
        setter(
            self.modified.as_mut().expect("clone was just installed"),
            new_value,
        );
        true
    }

    /// The effective value: the clone if any change was applied, otherwise
    /// the untouched original.
    pub fn current(&self) -> &T {
        self.modified.as_ref().unwrap_or(self.original)
    }

    pub fn is_modified(&self) -> bool {
        self.modified.is_some()
    }

    /// Consumes the updater, returning the clone when one was made.
    pub fn into_modified(self) -> Option<T> {
        self.modified
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Debug, Clone, PartialEq)]
    struct Knobs {
        temperature: f64,
        max_tokens: u32,
    }

    #[test]
    fn noop_mutations_never_clone() {
        let base = Knobs {
            temperature: 0.7,
            max_tokens: 256,
        };
        let clones = Cell::new(0u32);
        let mut updater = SettingsUpdater::new(&base, |k| {
            clones.set(clones.get() + 1);
            k.clone()
        });

        for _ in 0..5 {
            let changed = updater.modify_if_changed(
                |k| k.temperature,
                |t| *t,
                |k, t| k.temperature = t,
            );
            assert!(!changed);
        }

        assert_eq!(clones.get(), 0);
        assert!(!updater.is_modified());
        assert!(std::ptr::eq(updater.current(), &base));
    }

    #[test]
    fn one_real_change_clones_exactly_once() {
        let base = Knobs {
            temperature: 0.7,
            max_tokens: 256,
        };
        let clones = Cell::new(0u32);
        let mut updater = SettingsUpdater::new(&base, |k| {
            clones.set(clones.get() + 1);
            k.clone()
        });

        assert!(updater.modify_if_changed(
            |k| k.max_tokens,
            |m| m / 2,
            |k, m| k.max_tokens = m,
        ));
        assert!(updater.modify_if_changed(
            |k| k.temperature,
            |t| t + 0.1,
            |k, t| k.temperature = t,
        ));
        // No-op after real changes still must not clone again.
        assert!(!updater.modify_if_changed(
            |k| k.max_tokens,
            |m| *m,
            |k, m| k.max_tokens = m,
        ));

        assert_eq!(clones.get(), 1);
        assert_eq!(updater.current().max_tokens, 128);
        assert_eq!(base.max_tokens, 256);
    }
}
