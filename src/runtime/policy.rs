//! Execution-mode policy: decides, per intercepted call, whether the
//! intercepting thread keeps running or blocks waiting for a command.

use crate::classify::FunctionSpec;
use crate::error::Error;

/// How a traced thread treats intercepted calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Proceed through every call without blocking.
    Unattended,
    /// Consult the halt policy on every call.
    Interactive,
}

impl ExecutionMode {
    /// Validate a raw wire discriminant.
    pub fn from_raw(raw: u8) -> Result<Self, Error> {
        match raw {
            0 => Ok(ExecutionMode::Unattended),
            1 => Ok(ExecutionMode::Interactive),
            _ => Err(Error::InvalidOperation(format!(
                "execution mode discriminant {raw} out of range"
            ))),
        }
    }

    pub fn as_raw(self) -> u8 {
        match self {
            ExecutionMode::Unattended => 0,
            ExecutionMode::Interactive => 1,
        }
    }
}

/// Which intercepted calls halt an interactive thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HaltPolicy {
    /// Halt at every call.
    All,
    /// Halt at calls that switch the active shader.
    OnShaderSwitch,
    /// Halt at debuggable draw calls.
    OnDrawCall,
    /// Halt at every call except the named one.
    OnUserDefined(String),
}

impl HaltPolicy {
    /// Validate a raw wire discriminant plus its optional target name.
    pub fn from_raw(raw: u8, target: Option<String>) -> Result<Self, Error> {
        match raw {
            0 => Ok(HaltPolicy::All),
            1 => Ok(HaltPolicy::OnShaderSwitch),
            2 => Ok(HaltPolicy::OnDrawCall),
            3 => {
                let target = target.ok_or_else(|| {
                    Error::InvalidOperation("user-defined halt policy without a target".to_string())
                })?;
                Ok(HaltPolicy::OnUserDefined(target))
            }
            _ => Err(Error::InvalidOperation(format!(
                "halt policy discriminant {raw} out of range"
            ))),
        }
    }

    pub fn as_raw(&self) -> u8 {
        match self {
            HaltPolicy::All => 0,
            HaltPolicy::OnShaderSwitch => 1,
            HaltPolicy::OnDrawCall => 2,
            HaltPolicy::OnUserDefined(_) => 3,
        }
    }
}

/// Decide whether the intercepting thread proceeds without blocking.
///
/// Unattended threads always proceed. Interactive threads proceed only
/// when the halt policy says the call is not interesting.
pub fn keep_executing(
    mode: ExecutionMode,
    policy: &HaltPolicy,
    func_name: &str,
    spec: FunctionSpec,
) -> bool {
    match mode {
        ExecutionMode::Unattended => true,
        ExecutionMode::Interactive => match policy {
            HaltPolicy::All => false,
            HaltPolicy::OnShaderSwitch => !spec.is_shader_switch,
            HaltPolicy::OnDrawCall => !spec.is_debuggable,
            HaltPolicy::OnUserDefined(target) => func_name == target,
        },
    }
}
