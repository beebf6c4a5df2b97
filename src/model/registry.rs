//! Model identification.

use std::fmt;
use std::sync::Arc;

use crate::model::{
    Advertisement, BanlanX, BanlanX2, LedChord, LedHue, ModelDescriptor, SpTech, Zengge,
};
use crate::types::TransportKind;

/// Outcome of identifying an advertisement.
#[derive(Clone)]
pub enum MatchResult {
    /// No known family claims the advertisement.
    NoMatch,
    /// Several families claim it; a status query over a live connection has
    /// to decide.
    Ambiguous(Vec<Arc<dyn ModelDescriptor>>),
    /// Exactly one family.
    Matched(Arc<dyn ModelDescriptor>),
}

impl MatchResult {
    /// The matched descriptor, if identification was conclusive.
    #[must_use]
    pub fn matched(&self) -> Option<&Arc<dyn ModelDescriptor>> {
        match self {
            Self::Matched(model) => Some(model),
            _ => None,
        }
    }

    /// Every descriptor still in the running.
    #[must_use]
    pub fn candidates(&self) -> Vec<Arc<dyn ModelDescriptor>> {
        match self {
            Self::NoMatch => Vec::new(),
            Self::Ambiguous(models) => models.clone(),
            Self::Matched(model) => vec![Arc::clone(model)],
        }
    }
}

impl fmt::Debug for MatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMatch => f.write_str("NoMatch"),
            Self::Ambiguous(models) => f
                .debug_tuple("Ambiguous")
                .field(&models.iter().map(|m| m.name()).collect::<Vec<_>>())
                .finish(),
            Self::Matched(model) => f.debug_tuple("Matched").field(&model.name()).finish(),
        }
    }
}

/// Known model descriptors, in registration order.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    models: Vec<Arc<dyn ModelDescriptor>>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding every built-in family.
    #[must_use]
    pub fn builtin() -> Self {
        Self::new()
            .register(LedHue::sp110e())
            .register(LedHue::sp110e_legacy())
            .register(BanlanX::sp602e())
            .register(BanlanX::sp608e())
            .register(BanlanX2::sp611e())
            .register(BanlanX2::sp617e())
            .register(BanlanX2::sp620e())
            .register(BanlanX2::sp621e())
            .register(LedChord::sp107e())
            .register(SpTech::sp630e())
            .register(SpTech::sp631e())
            .register(SpTech::sp633e())
            .register(SpTech::sp638e())
            .register(SpTech::sp639e())
            .register(SpTech::sp530e())
            .register(Zengge::new())
    }

    /// Adds a descriptor.
    #[must_use]
    pub fn register(mut self, model: impl ModelDescriptor + 'static) -> Self {
        self.models.push(Arc::new(model));
        self
    }

    /// Registered descriptors.
    #[must_use]
    pub fn models(&self) -> &[Arc<dyn ModelDescriptor>] {
        &self.models
    }

    /// Identifies the family behind an advertisement or discovery reply.
    pub fn identify(&self, advertisement: &Advertisement) -> MatchResult {
        let candidates: Vec<_> = self
            .models
            .iter()
            .filter(|model| model.matches(advertisement))
            .cloned()
            .collect();

        match candidates.as_slice() {
            [] => return MatchResult::NoMatch,
            [only] => return MatchResult::Matched(Arc::clone(only)),
            _ => {}
        }

        let named = advertisement
            .name()
            .and_then(|name| candidates.iter().find(|m| m.name() == name));
        if let Some(model) = named {
            return MatchResult::Matched(Arc::clone(model));
        }

        let mut advertised: Vec<_> = candidates
            .iter()
            .filter(|m| {
                m.endpoints()
                    .service
                    .is_some_and(|service| advertisement.advertises(service))
            })
            .cloned()
            .collect();

        tracing::debug!(
            "{} matching models, {} with advertised service",
            candidates.len(),
            advertised.len()
        );
        match advertised.len() {
            0 => MatchResult::Ambiguous(candidates),
            1 => MatchResult::Matched(advertised.swap_remove(0)),
            _ => MatchResult::Ambiguous(advertised),
        }
    }

    /// Looks a descriptor up by model name.
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<Arc<dyn ModelDescriptor>> {
        self.models
            .iter()
            .find(|m| m.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Looks a descriptor up by transport and model code.
    #[must_use]
    pub fn by_code(&self, transport: TransportKind, code: u8) -> Option<Arc<dyn ModelDescriptor>> {
        self.models
            .iter()
            .find(|m| m.transport() == transport && m.code() == code)
            .cloned()
    }
}
