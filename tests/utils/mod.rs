// Integration test utilities
//
// Helpers for synthesizing trace files on disk

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracerelay::{Call, CallFlags, FunctionSig, TraceWriter, Value};

pub const SWAP: CallFlags = CallFlags::END_FRAME.union(CallFlags::SWAP_RENDERTARGET);

/// Builds a call stream, numbering calls and assigning signature ids
#[derive(Default)]
pub struct TraceBuilder {
    calls: Vec<Call>,
    sigs: HashMap<String, Arc<FunctionSig>>,
}

impl TraceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call(
        &mut self,
        thread_id: u32,
        name: &str,
        args: Vec<Value>,
        ret: Option<Value>,
        flags: CallFlags,
    ) -> &mut Self {
        let next_id = self.sigs.len() as u32;
        let sig = self
            .sigs
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(FunctionSig::new(next_id, name, &[])))
            .clone();
        self.calls.push(Call {
            no: self.calls.len() as u64,
            thread_id,
            sig,
            args,
            ret,
            flags,
            offset: 0,
        });
        self
    }

    /// Create and bind a GLX context with a 64x64 viewport on `thread_id`
    pub fn glx_setup(&mut self, thread_id: u32) -> &mut Self {
        self.call(
            thread_id,
            "glXCreateContext",
            vec![ptr(1), ptr(0), ptr(0), Value::Bool(true)],
            Some(ptr(0x20)),
            CallFlags::empty(),
        )
        .call(
            thread_id,
            "glXMakeCurrent",
            vec![ptr(1), ptr(0x10), ptr(0x20)],
            Some(Value::Bool(true)),
            CallFlags::SWAP_RENDERTARGET,
        )
        .call(
            thread_id,
            "glViewport",
            vec![int(0), int(0), int(64), int(64)],
            None,
            CallFlags::empty(),
        )
    }

    pub fn draw(&mut self, thread_id: u32) -> &mut Self {
        self.call(
            thread_id,
            "glDrawArrays",
            vec![int(4), int(0), int(3)],
            None,
            CallFlags::RENDER,
        )
    }

    pub fn swap(&mut self, thread_id: u32) -> &mut Self {
        self.call(thread_id, "glXSwapBuffers", vec![ptr(1), ptr(0x10)], None, SWAP)
    }

    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn write(&self, path: &Path) {
        let mut writer = TraceWriter::create(path).unwrap();
        for call in &self.calls {
            writer.write_call(call).unwrap();
        }
        writer.finish().unwrap();
    }
}

pub fn ptr(v: u64) -> Value {
    Value::Pointer(v)
}

pub fn int(v: i64) -> Value {
    Value::SInt(v)
}

/// `frames` frames; each draw alternates between the fore runner and thread 1
pub fn two_thread_trace(frames: usize) -> TraceBuilder {
    let mut builder = TraceBuilder::new();
    builder.glx_setup(0);
    for _ in 0..frames {
        builder.draw(0).draw(1).draw(0).swap(0);
    }
    builder
}
