// Drives a `CodeGen` over a linear operation stream.

mod op;

use std::collections::{HashMap, HashSet};

pub use op::Op;

use crate::abi::{DEFAULT_FRAME_BASE, DEFAULT_ORIGIN};
use crate::codegen::{BinaryOp, CodeGen, Label, Program, Target, UnaryOp};
use crate::isa::Image;
use crate::{Error, Result};

/// Settings for one compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    /// Load address of the assembled image.
    pub origin: u16,
    /// Initial contents of the frame-base cell.
    pub frame_base: u16,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            origin: DEFAULT_ORIGIN,
            frame_base: DEFAULT_FRAME_BASE,
        }
    }
}

/// Compile an operation stream into resolved chunks plus data.
pub fn compile(ops: &[Op], options: &CompileOptions) -> Result<Program> {
    let mut lowering = Lowering::new(options);
    for (pos, op) in ops.iter().enumerate() {
        tracing::trace!(pos, ?op, "lower");
        lowering.lower(op)?;
    }
    lowering.finish()
}

/// Compile and assemble at `options.origin`.
pub fn compile_to_image(ops: &[Op], options: &CompileOptions) -> Result<Image> {
    compile(ops, options)?.assemble(options.origin)
}

struct Lowering {
    cg: CodeGen,
    labels: HashMap<String, Label>,
    defined: HashSet<String>,
}

impl Lowering {
    fn new(options: &CompileOptions) -> Self {
        Self {
            cg: CodeGen::new(options.frame_base),
            labels: HashMap::new(),
            defined: HashSet::new(),
        }
    }

    fn label(&mut self, name: &str) -> Label {
        if let Some(label) = self.labels.get(name) {
            return *label;
        }
        let label = self.cg.alloc_label();
        self.labels.insert(name.to_string(), label);
        label
    }

    fn define(&mut self, name: &str) -> Result<Label> {
        if !self.defined.insert(name.to_string()) {
            return Err(Error::InvalidOp(format!("label `{name}` defined twice")));
        }
        Ok(self.label(name))
    }

    fn check_cell(&self, cell: u16) -> Result<()> {
        let len = self.cg.data().len();
        if usize::from(cell) >= len {
            return Err(Error::InvalidOp(format!(
                "data cell {cell} outside a segment of {len} cells"
            )));
        }
        Ok(())
    }

    fn lower(&mut self, op: &Op) -> Result<()> {
        match op {
            Op::Data { words } => {
                self.cg.data_mut().push_data(words);
                Ok(())
            }
            Op::PushConst { value } => self.cg.push_const(*value),
            Op::PushLabel { name } => {
                let label = self.label(name);
                self.cg.push_label_address(label)
            }
            Op::LoadData { cell } => {
                self.check_cell(*cell)?;
                self.cg.load_data(*cell)
            }
            Op::StoreData { cell } => {
                self.check_cell(*cell)?;
                self.cg.store_data(*cell)
            }
            Op::Pop { reg } => self.cg.pop(Target::Fixed(*reg)),
            Op::Drop => self.cg.discard(),
            Op::Copy { index } => self.cg.copy(*index),
            Op::Replace { index } => self.cg.replace(*index),
            Op::Swap { a, b } => self.cg.swap(*a, *b),
            Op::Join { index, count } => self.cg.join(*index, *count),
            Op::Split { index, size } => self.cg.split(*index, *size),
            Op::Add => self.cg.binary(BinaryOp::Add),
            Op::And => self.cg.binary(BinaryOp::And),
            Op::Sub => self.cg.binary(BinaryOp::Sub),
            Op::Not => self.cg.unary(UnaryOp::Not),
            Op::Neg => self.cg.unary(UnaryOp::Neg),
            Op::Call => self.cg.call(),
            Op::Yield => self.cg.yield_(),
            Op::Return => self.cg.ret(),
            Op::Entry { closure_size } => self.cg.entry(*closure_size),
            Op::Function { name } => {
                let label = self.define(name)?;
                self.cg.begin_function(label)
            }
            Op::Label { name } => {
                let label = self.define(name)?;
                self.cg.define_label(label)
            }
            Op::Flush => self.cg.flush(None),
            Op::Halt => self.cg.halt(),
        }
    }

    fn finish(self) -> Result<Program> {
        let mut missing: Vec<&String> = self
            .labels
            .keys()
            .filter(|name| !self.defined.contains(*name))
            .collect();
        missing.sort();
        if let Some(name) = missing.first() {
            return Err(Error::UnknownLabel((*name).clone()));
        }
        self.cg.finish()
    }
}
