#![doc = include_str!("../../../README.md")]

mod ast;
mod closure;
mod dynaload;
mod emit;
mod hash;
mod heap;
mod io;
mod lexer;
mod msgbuf;
mod opcode;
mod parser;
mod raiser;
mod sig;
mod state;
mod symtab;
pub mod tracer;
mod value;
mod vm;

pub use crate::{
    dynaload::SeedLoader,
    heap::GcStats,
    io::{CollectPrint, NoPrint, PrintWriter, StdPrint},
    lexer::ParseMode,
    opcode::Opcode,
    raiser::{ErrorClass, ErrorLocation, LilyError},
    state::{Options, State},
    tracer::{NoopTracer, RecordingTracer, StderrTracer, TraceEvent, VmTracer},
    value::{ForeignFn, ForeignRaise},
    vm::ForeignCall,
};
