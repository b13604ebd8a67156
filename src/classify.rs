//! GL function classification.
//!
//! The halt policy needs to know, per intercepted call, whether a function
//! is a debuggable draw call, switches the active shader, ends a frame or
//! changes the bound framebuffer. The table is an external collaborator in
//! the larger system; a small built-in subset ships as the default
//! implementation of the seam.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Classification of one GL entry point.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FunctionSpec {
    pub is_debuggable: bool,
    pub is_shader_switch: bool,
    pub is_frame_end: bool,
    pub is_framebuffer_change: bool,
    /// Index into the primitive-mode table for draw calls.
    pub primitive_mode: Option<usize>,
}

/// Lookup seam consumed by the halt-policy evaluation.
pub trait CallClassifier: Send + Sync {
    /// Classify `name`; unknown functions get the all-false default.
    fn classify(&self, name: &str) -> FunctionSpec;
}

/// Built-in table covering the classifications the halt policy consults.
pub struct BuiltinClassifier;

static BUILTIN: Lazy<HashMap<&'static str, FunctionSpec>> = Lazy::new(|| {
    let draw = |mode| FunctionSpec {
        is_debuggable: true,
        primitive_mode: Some(mode),
        ..Default::default()
    };
    let shader_switch = FunctionSpec {
        is_shader_switch: true,
        ..Default::default()
    };

    HashMap::from([
        ("glDrawArrays", draw(0)),
        ("glDrawElements", draw(0)),
        ("glDrawArraysInstanced", draw(0)),
        ("glDrawElementsInstanced", draw(0)),
        ("glDrawRangeElements", draw(0)),
        ("glMultiDrawArrays", draw(0)),
        ("glMultiDrawElements", draw(0)),
        ("glBegin", draw(1)),
        ("glUseProgram", shader_switch),
        ("glUseProgramStages", shader_switch),
        ("glLinkProgram", shader_switch),
        (
            "glXSwapBuffers",
            FunctionSpec {
                is_frame_end: true,
                ..Default::default()
            },
        ),
        (
            "eglSwapBuffers",
            FunctionSpec {
                is_frame_end: true,
                ..Default::default()
            },
        ),
        (
            "glBindFramebuffer",
            FunctionSpec {
                is_framebuffer_change: true,
                ..Default::default()
            },
        ),
    ])
});

impl CallClassifier for BuiltinClassifier {
    fn classify(&self, name: &str) -> FunctionSpec {
        BUILTIN.get(name).copied().unwrap_or_default()
    }
}
