use std::fmt;

use candle_core::{DType, Device};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    #[serde(alias = "mps")]
    #[value(alias = "mps")]
    Metal,
    Cuda,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Metal => "metal",
            DeviceKind::Cuda => "cuda",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[serde(alias = "float32")]
    #[value(alias = "float32")]
    F32,
    #[serde(alias = "float16")]
    #[value(alias = "float16")]
    F16,
    #[serde(alias = "bfloat16")]
    #[value(alias = "bfloat16")]
    Bf16,
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(precision_label(dtype_from_precision(*self)))
    }
}

/// Parse a precision name as accepted by the HTTP API.
///
/// Quantised precisions such as `int8` are rejected: weights are always loaded
/// in a floating point dtype.
pub fn parse_precision(name: &str) -> Result<Precision> {
    match name.trim().to_ascii_lowercase().as_str() {
        "f32" | "float32" => Ok(Precision::F32),
        "f16" | "float16" => Ok(Precision::F16),
        "bf16" | "bfloat16" => Ok(Precision::Bf16),
        other => Err(CoreError::Config(format!(
            "unsupported precision `{other}` (expected float32, float16 or bfloat16)"
        ))),
    }
}

pub fn parse_device(name: &str) -> Result<DeviceKind> {
    match name.trim().to_ascii_lowercase().as_str() {
        "cpu" => Ok(DeviceKind::Cpu),
        "cuda" | "gpu" => Ok(DeviceKind::Cuda),
        "metal" | "mps" => Ok(DeviceKind::Metal),
        other => Err(CoreError::Config(format!(
            "unsupported device `{other}` (expected cpu, cuda or metal)"
        ))),
    }
}

pub fn prepare_device_and_dtype(
    device: DeviceKind,
    precision: Option<Precision>,
) -> Result<(Device, Option<DType>)> {
    let (device, default_precision) = match device {
        DeviceKind::Cpu => (Device::Cpu, None),
        DeviceKind::Metal => (
            Device::new_metal(0).map_err(|err| {
                CoreError::Resource(format!("failed to initialise Metal device: {err}"))
            })?,
            Some(Precision::F16),
        ),
        DeviceKind::Cuda => (
            Device::new_cuda(0).map_err(|err| {
                CoreError::Resource(format!("failed to initialise CUDA device: {err}"))
            })?,
            Some(Precision::F16),
        ),
    };
    let dtype = precision.or(default_precision).map(dtype_from_precision);
    Ok((device, dtype))
}

pub fn default_dtype_for_device(device: &Device) -> DType {
    if device.is_metal() || device.is_cuda() {
        DType::F16
    } else {
        DType::F32
    }
}

pub fn dtype_from_precision(p: Precision) -> DType {
    match p {
        Precision::F32 => DType::F32,
        Precision::F16 => DType::F16,
        Precision::Bf16 => DType::BF16,
    }
}

pub fn precision_label(dtype: DType) -> &'static str {
    match dtype {
        DType::F32 => "float32",
        DType::F16 => "float16",
        DType::BF16 => "bfloat16",
        DType::F64 => "float64",
        _ => "other",
    }
}

/// Stable textual identity of a device, used for explainer cache keys and status reports.
pub fn device_label(device: &Device) -> String {
    match device {
        Device::Cpu => "cpu".to_string(),
        Device::Cuda(_) => "cuda:0".to_string(),
        Device::Metal(_) => "metal:0".to_string(),
    }
}
