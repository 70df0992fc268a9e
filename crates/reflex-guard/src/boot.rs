//! Boot gate - a sequencing marker that always passes

use reflex_types::Decision;

use crate::gate::{Gate, GateInput, Result, Runtime};

#[derive(Debug, Default, Clone)]
pub struct BootGate;

impl BootGate {
    pub fn new() -> Self {
        Self
    }
}

impl Gate for BootGate {
    fn name(&self) -> &str {
        "boot"
    }

    fn evaluate(&self, input: &GateInput<'_>, _runtime: &Runtime) -> Result<Decision> {
        Ok(Decision::pass(input.level_str()))
    }
}
