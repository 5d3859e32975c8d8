// icp-core/src/checkpoint/registry.rs

//! Registry of protected variables.
//!
//! The registry owns the bytes of every variable the application asked to
//! protect. A checkpoint reads it once; a restart writes restored bytes back
//! into it.

use crate::error::{IcpError, Result};

/// Identifier of a protected variable.
pub type VarId = u32;

/// One protected variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedVariable {
    id: VarId,
    data: Vec<u8>,
    element_size: usize,
    device_resident: bool,
}

impl ProtectedVariable {
    /// Creates a host-resident variable.
    pub fn new(id: VarId, data: Vec<u8>, element_size: usize) -> Self {
        Self {
            id,
            data,
            element_size: element_size.max(1),
            device_resident: false,
        }
    }

    pub fn id(&self) -> VarId {
        self.id
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    /// Number of whole elements.
    pub fn count(&self) -> usize {
        self.data.len() / self.element_size
    }

    /// Whether the application's copy lives in device memory.
    ///
    /// The bytes held here are the host-staged copy either way.
    pub fn is_device_resident(&self) -> bool {
        self.device_resident
    }

    /// Replaces the content, possibly changing the size.
    pub fn set_bytes(&mut self, data: Vec<u8>) {
        self.data = data;
    }
}

/// Ordered set of protected variables, in registration order.
#[derive(Debug, Clone, Default)]
pub struct VariableRegistry {
    vars: Vec<ProtectedVariable>,
}

impl VariableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Protects a variable, or replaces the content of an already protected
    /// one while keeping its position.
    pub fn protect(&mut self, id: VarId, data: Vec<u8>, element_size: usize) {
        self.insert(ProtectedVariable::new(id, data, element_size));
    }

    /// Like [`protect`](Self::protect) for a variable whose primary copy is
    /// in device memory; `data` is its host-staged copy.
    pub fn protect_device(&mut self, id: VarId, data: Vec<u8>, element_size: usize) {
        let mut var = ProtectedVariable::new(id, data, element_size);
        var.device_resident = true;
        self.insert(var);
    }

    fn insert(&mut self, var: ProtectedVariable) {
        match self.vars.iter_mut().find(|v| v.id == var.id) {
            Some(existing) => *existing = var,
            None => self.vars.push(var),
        }
    }

    /// Stops protecting a variable.
    ///
    /// # Errors
    ///
    /// Returns `UnknownVariable` if the id is not registered.
    pub fn remove(&mut self, id: VarId) -> Result<ProtectedVariable> {
        let idx = self
            .vars
            .iter()
            .position(|v| v.id == id)
            .ok_or_else(|| IcpError::unknown_variable(id))?;
        Ok(self.vars.remove(idx))
    }

    pub fn get(&self, id: VarId) -> Option<&ProtectedVariable> {
        self.vars.iter().find(|v| v.id == id)
    }

    pub fn get_mut(&mut self, id: VarId) -> Option<&mut ProtectedVariable> {
        self.vars.iter_mut().find(|v| v.id == id)
    }

    /// Looks up a variable, failing with `UnknownVariable`.
    pub fn require(&self, id: VarId) -> Result<&ProtectedVariable> {
        self.get(id).ok_or_else(|| IcpError::unknown_variable(id))
    }

    pub fn contains(&self, id: VarId) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProtectedVariable> {
        self.vars.iter()
    }

    pub fn ids(&self) -> Vec<VarId> {
        self.vars.iter().map(|v| v.id).collect()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Total protected bytes.
    pub fn total_size(&self) -> u64 {
        self.vars.iter().map(ProtectedVariable::size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protect_keeps_registration_order() {
        let mut registry = VariableRegistry::new();
        registry.protect(5, vec![0; 8], 4);
        registry.protect(1, vec![0; 16], 8);
        registry.protect(5, vec![1; 12], 4);

        assert_eq!(registry.ids(), vec![5, 1]);
        assert_eq!(registry.get(5).unwrap().size(), 12);
        assert_eq!(registry.get(5).unwrap().count(), 3);
        assert_eq!(registry.total_size(), 28);
    }

    #[test]
    fn test_remove_unknown_fails() {
        let mut registry = VariableRegistry::new();
        registry.protect(1, vec![1, 2, 3], 1);

        assert!(matches!(
            registry.remove(9),
            Err(IcpError::UnknownVariable { id: 9 })
        ));
        assert_eq!(registry.remove(1).unwrap().bytes(), &[1, 2, 3]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_device_flag() {
        let mut registry = VariableRegistry::new();
        registry.protect_device(2, vec![0; 4], 0);
        let var = registry.require(2).unwrap();
        assert!(var.is_device_resident());
        assert_eq!(var.element_size(), 1);
        assert!(registry.require(3).is_err());
    }
}
