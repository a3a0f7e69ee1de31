// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::io;

use thiserror::Error;

/// Trap taxonomy. Every runtime failure the interpreter can surface to the
/// guest program is one of these; they travel in-band as error values
/// carrying the function and pc where they were raised.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("unknown global")]
    UnknownGlobal,
    #[error("unknown function")]
    UnknownFunction,
    #[error("unknown primitive type")]
    UnknownPrimitiveType,
    #[error("unknown region type")]
    UnknownRegionType,
    #[error("unknown opcode")]
    UnknownOpcode,
    #[error("unknown math op")]
    UnknownMathOp,
    #[error("bad alloc target")]
    BadAllocTarget,
    #[error("bad label")]
    BadLabel,
    #[error("bad field")]
    BadField,
    #[error("bad array index")]
    BadArrayIndex,
    #[error("bad ref target")]
    BadRefTarget,
    #[error("bad load target")]
    BadLoadTarget,
    #[error("bad store target")]
    BadStoreTarget,
    #[error("bad store")]
    BadStore,
    #[error("bad method target")]
    BadMethodTarget,
    #[error("method not found")]
    MethodNotFound,
    #[error("bad conditional")]
    BadConditional,
    #[error("bad conversion")]
    BadConversion,
    #[error("bad operand")]
    BadOperand,
    #[error("mismatched types")]
    MismatchedTypes,
    #[error("bad stack escape")]
    BadStackEscape,
    #[error("bad args")]
    BadArgs,
    #[error("bad type")]
    BadType,
    #[error("bad region entry point")]
    BadRegionEntryPoint,
}

/// An in-flight trap: the kind plus the function and pc it was raised at,
/// for diagnostics. `func == u32::MAX` marks a trap raised outside any
/// frame (behaviour setup, cown stores from the host).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub func: u32,
    pub pc: u64,
}

impl ErrorInfo {
    pub fn hostside(kind: ErrorKind) -> ErrorInfo {
        ErrorInfo {
            kind,
            func: u32::MAX,
            pc: 0,
        }
    }
}

/// Failures detected while loading a program file. These never reach the
/// interpreter; the CLI reports them and exits with a negative status.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("{path}: could not open for reading: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("{path}: does not start with the magic number")]
    BadMagic { path: String },
    #[error("{path}: has an unknown version number")]
    BadVersion { path: String },
    #[error("{path}: invalid debug offset")]
    BadDebugOffset { path: String },
    #[error("{path}: truncated or malformed: {reason}")]
    Malformed { path: String, reason: String },
    #[error("{path}: has no functions")]
    NoFunctions { path: String },
    #[error("{path}: `main` must take zero parameters")]
    BadMainSignature { path: String },
    #[error("{path}: too many fields in class")]
    TooManyFields { path: String },
    #[error("{path}: finalizer must have one parameter")]
    BadFinalizer { path: String },
    #[error("{path}: could not lay out class {class}")]
    BadClassLayout { path: String, class: u32 },
    #[error("{path}: could not open library {lib}")]
    BadLibrary { path: String, lib: String },
    #[error("{path}: could not resolve symbol {symbol}")]
    BadSymbol { path: String, symbol: String },
}
