//! Configuration for kiln backends.
//!
//! Settings are read from a KDL document and then overridden by `KILN_*` environment variables,
//! so that a compositor can ship defaults while users keep the usual environment knobs.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use miette::{Context, IntoDiagnostic};
use tracing::{debug, warn};

/// Backend names selected by the `backends` node or `KILN_BACKENDS`.
pub const ENV_BACKENDS: &str = "KILN_BACKENDS";
pub const ENV_HEADLESS_OUTPUTS: &str = "KILN_HEADLESS_OUTPUTS";
pub const ENV_WL_OUTPUTS: &str = "KILN_WL_OUTPUTS";
pub const ENV_X11_OUTPUTS: &str = "KILN_X11_OUTPUTS";
pub const ENV_LIBINPUT_NO_DEVICES: &str = "KILN_LIBINPUT_NO_DEVICES";
pub const ENV_DRM_DEVICES: &str = "KILN_DRM_DEVICES";
pub const ENV_RENDER_DRM_DEVICE: &str = "KILN_RENDER_DRM_DEVICE";

#[derive(knuffel::Decode, Debug, Default, Clone, PartialEq)]
pub struct Config {
    /// Backends to start, in order. Empty means automatic selection.
    #[knuffel(child, unwrap(arguments), default)]
    pub backends: Vec<BackendKind>,
    #[knuffel(child, unwrap(argument))]
    pub headless_outputs: Option<u32>,
    #[knuffel(child, unwrap(argument))]
    pub wayland_outputs: Option<u32>,
    #[knuffel(child, unwrap(argument))]
    pub x11_outputs: Option<u32>,
    #[knuffel(child, default)]
    pub debug: Debug,
}

#[derive(knuffel::Decode, Debug, Default, Clone, PartialEq)]
pub struct Debug {
    /// Render node to use for the renderer instead of the primary GPU's.
    #[knuffel(child, unwrap(argument))]
    pub render_drm_device: Option<PathBuf>,
    /// Explicit list of KMS devices, bypassing discovery. The first one is the primary GPU.
    #[knuffel(children(name = "drm-device"), unwrap(argument))]
    pub drm_devices: Vec<PathBuf>,
    #[knuffel(children(name = "ignore-drm-device"), unwrap(argument))]
    pub ignored_drm_devices: Vec<PathBuf>,
    #[knuffel(child)]
    pub libinput_allow_no_devices: bool,
    #[knuffel(child)]
    pub disable_cursor_plane: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Drm,
    Libinput,
    Headless,
    Wayland,
    X11,
}

impl BackendKind {
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Drm => "drm",
            BackendKind::Libinput => "libinput",
            BackendKind::Headless => "headless",
            BackendKind::Wayland => "wayland",
            BackendKind::X11 => "x11",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownBackend(pub String);

impl fmt::Display for UnknownBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown backend: {:?}", self.0)
    }
}

impl std::error::Error for UnknownBackend {}

impl FromStr for BackendKind {
    type Err = UnknownBackend;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drm" => Ok(Self::Drm),
            "libinput" => Ok(Self::Libinput),
            "headless" => Ok(Self::Headless),
            "wayland" => Ok(Self::Wayland),
            "x11" => Ok(Self::X11),
            _ => Err(UnknownBackend(s.to_owned())),
        }
    }
}

impl<S: knuffel::traits::ErrorSpan> knuffel::DecodeScalar<S> for BackendKind {
    fn type_check(
        type_name: &Option<knuffel::span::Spanned<knuffel::ast::TypeName, S>>,
        ctx: &mut knuffel::decode::Context<S>,
    ) {
        if let Some(type_name) = &type_name {
            ctx.emit_error(knuffel::errors::DecodeError::unexpected(
                type_name,
                "type name",
                "no type name expected for this node",
            ));
        }
    }

    fn raw_decode(
        val: &knuffel::span::Spanned<knuffel::ast::Literal, S>,
        ctx: &mut knuffel::decode::Context<S>,
    ) -> Result<Self, knuffel::errors::DecodeError<S>> {
        match &**val {
            knuffel::ast::Literal::String(s) => match s.parse() {
                Ok(kind) => Ok(kind),
                Err(err) => {
                    ctx.emit_error(knuffel::errors::DecodeError::conversion(val, err));
                    Ok(BackendKind::Drm)
                }
            },
            _ => {
                ctx.emit_error(knuffel::errors::DecodeError::scalar_kind(
                    knuffel::decode::Kind::String,
                    val,
                ));
                Ok(BackendKind::Drm)
            }
        }
    }
}

impl Config {
    pub fn parse(filename: &str, text: &str) -> Result<Self, knuffel::Error> {
        knuffel::parse(filename, text)
    }

    pub fn load(path: &Path) -> miette::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .into_diagnostic()
            .wrap_err_with(|| format!("error reading {path:?}"))?;

        let config = Self::parse(
            path.file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("config.kdl"),
            &contents,
        )
        .map_err(miette::Report::new)
        .context("error parsing")?;
        debug!("loaded config from {path:?}");
        Ok(config)
    }

    /// Applies overrides from the process environment.
    pub fn apply_process_env(&mut self) {
        self.apply_env(|name| std::env::var(name).ok());
    }

    /// Applies `KILN_*` overrides read through `var`.
    ///
    /// Values that fail to parse are reported and leave the setting untouched.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(value) = var(ENV_BACKENDS) {
            let mut backends = Vec::new();
            let mut valid = true;
            for name in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                match name.parse() {
                    Ok(kind) => backends.push(kind),
                    Err(err) => {
                        warn!("ignoring {ENV_BACKENDS}: {err}");
                        valid = false;
                        break;
                    }
                }
            }
            if valid {
                self.backends = backends;
            }
        }

        parse_count(&var, ENV_HEADLESS_OUTPUTS, &mut self.headless_outputs);
        parse_count(&var, ENV_WL_OUTPUTS, &mut self.wayland_outputs);
        parse_count(&var, ENV_X11_OUTPUTS, &mut self.x11_outputs);

        if let Some(value) = var(ENV_LIBINPUT_NO_DEVICES) {
            match value.as_str() {
                "1" => self.debug.libinput_allow_no_devices = true,
                "0" => self.debug.libinput_allow_no_devices = false,
                _ => warn!("ignoring {ENV_LIBINPUT_NO_DEVICES}: expected 0 or 1, got {value:?}"),
            }
        }

        if let Some(value) = var(ENV_DRM_DEVICES) {
            self.debug.drm_devices = value
                .split(':')
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect();
        }

        if let Some(value) = var(ENV_RENDER_DRM_DEVICE) {
            self.debug.render_drm_device = (!value.is_empty()).then(|| PathBuf::from(value));
        }
    }
}

fn parse_count(var: &impl Fn(&str) -> Option<String>, name: &str, target: &mut Option<u32>) {
    let Some(value) = var(name) else {
        return;
    };

    match value.trim().parse() {
        Ok(count) => *target = Some(count),
        Err(err) => warn!("ignoring {name}={value:?}: {err}"),
    }
}
