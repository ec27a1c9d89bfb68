use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Device, SampleFormat, SampleRate};
use talkover_foundation::AudioError;

/// Negotiated output parameters, resolved before the render thread starts so
/// the ring buffer and resampler can be sized to the real device rate.
#[derive(Debug, Clone)]
pub struct OutputPlan {
    /// Resolved device name, used to re-open the same device on the render
    /// thread. `None` means the system default.
    pub device_name: Option<String>,
    pub channels: u16,
    pub sample_rate: u32,
    pub sample_format: SampleFormat,
}

/// Pick an output device and the closest usable configuration to
/// `desired_rate` Hz mono. Falls back to the device default configuration
/// when the desired rate is not supported; the caller resamples in that case.
pub fn negotiate_output(
    preferred: Option<&str>,
    desired_rate: u32,
) -> Result<OutputPlan, AudioError> {
    let device = resolve_output_device(preferred)?;
    let device_name = device.name().ok();

    // Prefer an exact-rate config: fewest channels first, i16 over f32.
    let mut best: Option<(u16, SampleFormat)> = None;
    for range in device.supported_output_configs()? {
        let format = range.sample_format();
        if format != SampleFormat::I16 && format != SampleFormat::F32 {
            continue;
        }
        if range.try_with_sample_rate(SampleRate(desired_rate)).is_none() {
            continue;
        }
        let candidate = (range.channels(), format);
        best = match best {
            None => Some(candidate),
            Some(current) => {
                let better = candidate.0 < current.0
                    || (candidate.0 == current.0
                        && candidate.1 == SampleFormat::I16
                        && current.1 != SampleFormat::I16);
                Some(if better { candidate } else { current })
            }
        };
    }

    if let Some((channels, sample_format)) = best {
        return Ok(OutputPlan {
            device_name,
            channels,
            sample_rate: desired_rate,
            sample_format,
        });
    }

    let default = device
        .default_output_config()
        .map_err(|e| AudioError::FormatNotSupported {
            format: e.to_string(),
        })?;
    let sample_format = default.sample_format();
    if sample_format != SampleFormat::I16 && sample_format != SampleFormat::F32 {
        return Err(AudioError::FormatNotSupported {
            format: format!("{:?}", sample_format),
        });
    }
    tracing::info!(
        rate = default.sample_rate().0,
        desired = desired_rate,
        "Output device does not support the desired rate; will resample"
    );
    Ok(OutputPlan {
        device_name,
        channels: default.channels(),
        sample_rate: default.sample_rate().0,
        sample_format,
    })
}

pub fn resolve_output_device(name: Option<&str>) -> Result<Device, AudioError> {
    resolve_device(name, Direction::Output)
}

pub fn resolve_input_device(name: Option<&str>) -> Result<Device, AudioError> {
    resolve_device(name, Direction::Input)
}

pub fn output_device_names() -> Vec<String> {
    device_names(Direction::Output)
}

pub fn input_device_names() -> Vec<String> {
    device_names(Direction::Input)
}

#[derive(Clone, Copy)]
enum Direction {
    Input,
    Output,
}

fn devices_for(host: &cpal::Host, direction: Direction) -> Vec<Device> {
    let iter = match direction {
        Direction::Input => host.input_devices(),
        Direction::Output => host.output_devices(),
    };
    match iter {
        Ok(devices) => devices.collect(),
        Err(e) => {
            tracing::warn!("Failed to enumerate audio devices: {}", e);
            Vec::new()
        }
    }
}

fn resolve_device(name: Option<&str>, direction: Direction) -> Result<Device, AudioError> {
    let host = cpal::default_host();

    if let Some(preferred) = name {
        let devices = devices_for(&host, direction);
        // Exact match first, then a case-insensitive substring match.
        for device in &devices {
            if device.name().map(|n| n == preferred).unwrap_or(false) {
                return Ok(device.clone());
            }
        }
        let needle = preferred.to_lowercase();
        for device in &devices {
            if let Ok(device_name) = device.name() {
                if device_name.to_lowercase().contains(&needle) {
                    tracing::warn!(
                        "Preferred device '{}' not found exactly; using closest match '{}'",
                        preferred,
                        device_name
                    );
                    return Ok(device.clone());
                }
            }
        }
        // A specific name was requested; do not silently fall back.
        return Err(AudioError::DeviceNotFound {
            name: Some(preferred.to_string()),
        });
    }

    let default = match direction {
        Direction::Input => host.default_input_device(),
        Direction::Output => host.default_output_device(),
    };
    default.ok_or(AudioError::DeviceNotFound { name: None })
}

fn device_names(direction: Direction) -> Vec<String> {
    let host = cpal::default_host();
    devices_for(&host, direction)
        .iter()
        .filter_map(|d| d.name().ok())
        .collect()
}
