//! # Registry Set
//!
//! One [`PoolRegistry`] per `(layout, usage)` pair, created on first use.
//! Lookup is a linear scan: a renderer has a handful of layouts.

use std::rc::Rc;

use crate::config::SharedBufferConfig;
use crate::device::BufferDevice;
use crate::error::{PoolError, PoolResult};
use crate::layout::{BufferLayout, BufferUsage};
use crate::registry::PoolRegistry;
use crate::stats::RegistryStats;

/// Every registry of one device.
pub struct RegistrySet<D: BufferDevice> {
    device: Rc<D>,
    config: SharedBufferConfig,
    registries: Vec<PoolRegistry<D>>,
}

impl<D: BufferDevice> RegistrySet<D> {
    /// Creates an empty set.
    #[must_use]
    pub fn new(device: Rc<D>, config: SharedBufferConfig) -> Self {
        Self {
            device,
            config,
            registries: Vec::new(),
        }
    }

    /// The registry for `layout` and `usage`, created if missing.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidArgument`] if a new registry would get an invalid
    /// layout.
    pub fn get_with(
        &mut self,
        layout: &BufferLayout,
        usage: BufferUsage,
    ) -> PoolResult<&mut PoolRegistry<D>> {
        let position = match self.registries.iter().position(|r| r.matches(layout, usage)) {
            Some(position) => position,
            None => {
                let registry = PoolRegistry::new(
                    Rc::clone(&self.device),
                    layout.clone(),
                    usage,
                    &self.config,
                )?;
                self.registries.push(registry);
                self.registries.len() - 1
            }
        };
        self.registries
            .get_mut(position)
            .ok_or(PoolError::InvariantViolation("registry vanished after insert"))
    }

    /// The registry for `layout` and `usage`, if one exists.
    #[must_use]
    pub fn get(&self, layout: &BufferLayout, usage: BufferUsage) -> Option<&PoolRegistry<D>> {
        self.registries.iter().find(|r| r.matches(layout, usage))
    }

    /// Prepares every pool of every registry.
    ///
    /// # Errors
    ///
    /// The first error encountered; all registries are still attempted.
    pub fn prepare_all(&self) -> PoolResult<()> {
        let mut first_error = None;
        for registry in &self.registries {
            if let Err(err) = registry.prepare_all() {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Usage of every registry in creation order.
    #[must_use]
    pub fn stats(&self) -> Vec<RegistryStats> {
        self.registries.iter().map(PoolRegistry::stats).collect()
    }

    /// Developer dump of every registry, pool and block.
    #[must_use]
    pub fn report(&self) -> String {
        let mut text = String::new();
        for (i, registry) in self.registries.iter().enumerate() {
            // Writing into a String cannot fail.
            let _ = registry.write_report(i, &mut text);
        }
        text
    }

    /// Configuration used for new registries.
    #[must_use]
    pub fn config(&self) -> &SharedBufferConfig {
        &self.config
    }

    /// Number of registries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registries.len()
    }

    /// Whether no registry exists yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registries.is_empty()
    }

    /// Registries in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &PoolRegistry<D>> {
        self.registries.iter()
    }
}
