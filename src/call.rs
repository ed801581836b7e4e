//! Call records: one deserialized API invocation
//!
//! A [`Call`] is immutable once decoded. It travels from the trace source
//! through the prefetch pipeline into the threaded parser, which hands out
//! shared [`CallRef`] handles to the relay runners.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Shared handle to a decoded call
pub type CallRef = Arc<Call>;

bitflags! {
    /// Per-call behaviour flags recorded at trace time
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct CallFlags: u32 {
        /// The call completes a frame (swap buffers, present)
        const END_FRAME = 0b0000_0001;
        /// The call swaps or rebinds the render target
        const SWAP_RENDERTARGET = 0b0000_0010;
        /// The call renders (draw calls); GPU and pixel profiling apply
        const RENDER = 0b0000_0100;
        /// The call only queries state
        const NO_SIDE_EFFECTS = 0b0000_1000;
    }
}

/// Function signature: name plus argument names
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionSig {
    pub id: u32,
    pub name: String,
    pub arg_names: Vec<String>,
}

impl FunctionSig {
    pub fn new(id: u32, name: impl Into<String>, arg_names: &[&str]) -> Self {
        Self {
            id,
            name: name.into(),
            arg_names: arg_names.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// A recorded argument or return value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    SInt(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Blob(Vec<u8>),
    Array(Vec<Value>),
    Pointer(u64),
}

impl Value {
    pub fn to_uint(&self) -> u64 {
        match self {
            Value::Bool(b) => *b as u64,
            Value::SInt(v) => *v as u64,
            Value::UInt(v) | Value::Pointer(v) => *v,
            Value::Float(v) => *v as u64,
            _ => 0,
        }
    }

    pub fn to_sint(&self) -> i64 {
        match self {
            Value::Bool(b) => *b as i64,
            Value::SInt(v) => *v,
            Value::UInt(v) | Value::Pointer(v) => *v as i64,
            Value::Float(v) => *v as i64,
            _ => 0,
        }
    }

    /// Opaque handle value (pointer-sized integer)
    pub fn to_uint_ptr(&self) -> u64 {
        self.to_uint()
    }

    pub fn to_bool(&self) -> bool {
        self.to_uint() != 0
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(values) => Some(values),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", if *b { "true" } else { "false" }),
            Value::SInt(v) => write!(f, "{}", v),
            Value::UInt(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Str(s) => write!(f, "\"{}\"", s),
            Value::Blob(b) => write!(f, "blob({})", b.len()),
            Value::Pointer(p) => write!(f, "0x{:x}", p),
            Value::Array(values) => {
                write!(f, "{{")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// One recorded API invocation
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    /// Sequence number, unique and increasing through the trace
    pub no: u64,
    /// Thread of record (the relay leg this call belongs to)
    pub thread_id: u32,
    pub sig: Arc<FunctionSig>,
    pub args: Vec<Value>,
    pub ret: Option<Value>,
    pub flags: CallFlags,
    /// Byte offset of the record in the trace body
    pub offset: u64,
}

impl Call {
    pub fn name(&self) -> &str {
        &self.sig.name
    }

    /// Argument by index, `Null` when the trace recorded fewer arguments
    pub fn arg(&self, index: usize) -> &Value {
        static NULL: Value = Value::Null;
        self.args.get(index).unwrap_or(&NULL)
    }

    pub fn ret_or_null(&self) -> &Value {
        static NULL: Value = Value::Null;
        self.ret.as_ref().unwrap_or(&NULL)
    }

    pub fn ends_frame(&self) -> bool {
        self.flags.contains(CallFlags::END_FRAME)
    }

    pub fn swaps_render_target(&self) -> bool {
        self.flags.contains(CallFlags::SWAP_RENDERTARGET)
    }

    pub fn is_draw(&self) -> bool {
        self.flags.contains(CallFlags::RENDER)
    }
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}(", self.no, self.sig.name)?;
        for (i, value) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match self.sig.arg_names.get(i) {
                Some(name) => write!(f, "{} = {}", name, value)?,
                None => write!(f, "{}", value)?,
            }
        }
        write!(f, ")")?;
        if let Some(ret) = &self.ret {
            write!(f, " = {}", ret)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(args: Vec<Value>, ret: Option<Value>) -> Call {
        Call {
            no: 7,
            thread_id: 0,
            sig: Arc::new(FunctionSig::new(1, "glXMakeCurrent", &["dpy", "drawable", "ctx"])),
            args,
            ret,
            flags: CallFlags::empty(),
            offset: 0,
        }
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::SInt(-1).to_sint(), -1);
        assert_eq!(Value::Pointer(0xdead).to_uint_ptr(), 0xdead);
        assert!(Value::Bool(true).to_bool());
        assert!(!Value::Null.to_bool());
        assert_eq!(Value::Str("x".into()).to_uint(), 0);
        assert!(Value::Array(vec![Value::UInt(1)]).as_array().is_some());
        assert!(Value::UInt(1).as_array().is_none());
    }

    #[test]
    fn test_missing_argument_is_null() {
        let c = call(vec![Value::Pointer(1)], None);
        assert_eq!(c.arg(0), &Value::Pointer(1));
        assert_eq!(c.arg(5), &Value::Null);
        assert_eq!(c.ret_or_null(), &Value::Null);
    }

    #[test]
    fn test_display_includes_arg_names() {
        let c = call(
            vec![Value::Pointer(1), Value::UInt(2), Value::Pointer(0x10)],
            Some(Value::Bool(true)),
        );
        assert_eq!(
            c.to_string(),
            "7 glXMakeCurrent(dpy = 0x1, drawable = 2, ctx = 0x10) = true"
        );
    }

    #[test]
    fn test_flags() {
        let mut c = call(vec![], None);
        c.flags = CallFlags::END_FRAME | CallFlags::SWAP_RENDERTARGET;
        assert!(c.ends_frame());
        assert!(c.swaps_render_target());
        assert!(!c.is_draw());
    }
}
