//! VM execution tracing hooks.
//!
//! A trait-based tracing system with zero cost when unused: the VM is
//! generic over its tracer, so [`NoopTracer`]'s empty hooks compile away
//! entirely. [`StderrTracer`] gives a human-readable execution log and
//! [`RecordingTracer`] captures events for post-mortem inspection, which
//! is what the old debug dump grew into.

use crate::opcode::Opcode;

/// One recorded execution event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// An opcode was dispatched at this code position.
    Instruction { pos: usize, opcode: Opcode },
    /// A call pushed a frame; depth is the stack depth after the push.
    Call { name: String, depth: usize },
    /// A return popped a frame.
    Return { depth: usize },
    /// A closure cell was read.
    CellLoad { spot: u16 },
    /// A closure cell was written.
    CellStore { spot: u16 },
    /// A collection pass ran, reclaiming this many tagged objects.
    GcPass { reclaimed: usize },
}

/// Hook points for VM execution. Every method has a no-op default, so
/// implementations only override what they need, and the no-op tracer
/// costs nothing after monomorphization.
pub trait VmTracer {
    /// Called before every opcode dispatch. The hottest hook; keep it
    /// light.
    #[inline]
    fn on_instruction(&mut self, _pos: usize, _opcode: Opcode) {}

    fn on_call(&mut self, _name: &str, _depth: usize) {}

    fn on_return(&mut self, _depth: usize) {}

    fn on_cell_load(&mut self, _spot: u16) {}

    fn on_cell_store(&mut self, _spot: u16) {}

    fn on_gc_pass(&mut self, _reclaimed: usize) {}
}

/// The production default: every hook compiles to nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {}

/// Logs execution to stderr.
#[derive(Debug, Default)]
pub struct StderrTracer;

impl VmTracer for StderrTracer {
    fn on_instruction(&mut self, pos: usize, opcode: Opcode) {
        eprintln!("[vm] {pos:>5} {opcode:?}");
    }

    fn on_call(&mut self, name: &str, depth: usize) {
        eprintln!("[vm] call {name} (depth {depth})");
    }

    fn on_return(&mut self, depth: usize) {
        eprintln!("[vm] return (depth {depth})");
    }

    fn on_gc_pass(&mut self, reclaimed: usize) {
        eprintln!("[vm] gc pass reclaimed {reclaimed}");
    }
}

/// Records every event for later inspection.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Vec<TraceEvent>,
}

impl RecordingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// Opcodes dispatched, in order. Convenient for asserting on control
    /// flow in tests.
    pub fn opcodes(&self) -> Vec<Opcode> {
        self.events
            .iter()
            .filter_map(|e| match e {
                TraceEvent::Instruction { opcode, .. } => Some(*opcode),
                _ => None,
            })
            .collect()
    }
}

impl VmTracer for RecordingTracer {
    fn on_instruction(&mut self, pos: usize, opcode: Opcode) {
        self.events.push(TraceEvent::Instruction { pos, opcode });
    }

    fn on_call(&mut self, name: &str, depth: usize) {
        self.events.push(TraceEvent::Call {
            name: name.to_string(),
            depth,
        });
    }

    fn on_return(&mut self, depth: usize) {
        self.events.push(TraceEvent::Return { depth });
    }

    fn on_cell_load(&mut self, spot: u16) {
        self.events.push(TraceEvent::CellLoad { spot });
    }

    fn on_cell_store(&mut self, spot: u16) {
        self.events.push(TraceEvent::CellStore { spot });
    }

    fn on_gc_pass(&mut self, reclaimed: usize) {
        self.events.push(TraceEvent::GcPass { reclaimed });
    }
}
