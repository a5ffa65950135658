//! Shared value types exchanged between the manager, its workers, and frontends.

use std::fmt;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::codec::PremulImage;

/// Width and height of an image or viewport, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ImageDimensions {
    pub w: u32,
    pub h: u32,
}

impl ImageDimensions {
    pub const ZERO: ImageDimensions = ImageDimensions { w: 0, h: 0 };

    pub fn new(w: u32, h: u32) -> Self {
        Self { w, h }
    }

    /// True when either dimension is zero; a zero size requests natural-size loads.
    pub fn is_zero(self) -> bool {
        self.w == 0 || self.h == 0
    }

    /// True when `self` fits entirely inside `container`.
    pub fn fits_inside(self, container: ImageDimensions) -> bool {
        self.w <= container.w && self.h <= container.h
    }
}

impl fmt::Display for ImageDimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.w, self.h)
    }
}

impl From<(u32, u32)> for ImageDimensions {
    fn from((w, h): (u32, u32)) -> Self {
        Self { w, h }
    }
}

/// The container backing an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Rar,
    SevenZip,
    Directory,
    Fileset,
    Unknown,
}

impl ArchiveKind {
    /// Short label used in logs.
    pub fn label(self) -> &'static str {
        match self {
            ArchiveKind::Zip => "zip",
            ArchiveKind::Rar => "rar",
            ArchiveKind::SevenZip => "7z",
            ArchiveKind::Directory => "dir",
            ArchiveKind::Fileset => "fileset",
            ArchiveKind::Unknown => "unknown",
        }
    }

    /// The coarse type exposed to executed helpers via `AWMAN_ARCHIVE_TYPE`.
    pub fn env_name(self) -> &'static str {
        match self {
            ArchiveKind::Zip | ArchiveKind::Rar | ArchiveKind::SevenZip => "archive",
            ArchiveKind::Directory => "directory",
            ArchiveKind::Fileset => "fileset",
            ArchiveKind::Unknown => "unknown",
        }
    }

    pub fn is_container(self) -> bool {
        matches!(self, ArchiveKind::Zip | ArchiveKind::Rar | ArchiveKind::SevenZip)
    }
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Destination of a `jump` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpTarget {
    /// 1-indexed page within the current archive.
    Absolute(usize),
    Forward(usize),
    Backward(usize),
}

/// User input vocabulary, shared by shortcuts and the socket IPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    NextPage,
    PreviousPage,
    FirstPage,
    LastPage,
    NextArchive,
    PreviousArchive,
    ToggleManga,
    ToggleUpscaling,
    Jump(JumpTarget),
}

impl Command {
    /// Parses an action name such as `NextPage`, `toggle_manga`, or `Jump +3`.
    pub fn parse_action(action: &str) -> Option<Command> {
        let action = action.trim();
        let (name, arg) = match action.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, Some(arg.trim())),
            None => (action, None),
        };
        let name: String =
            name.chars().filter(|c| *c != '_' && *c != '-').collect::<String>().to_lowercase();

        let command = match name.as_str() {
            "nextpage" => Command::NextPage,
            "previouspage" | "prevpage" => Command::PreviousPage,
            "firstpage" => Command::FirstPage,
            "lastpage" => Command::LastPage,
            "nextarchive" => Command::NextArchive,
            "previousarchive" | "prevarchive" => Command::PreviousArchive,
            "togglemanga" | "mangatoggle" => Command::ToggleManga,
            "toggleupscaling" | "upscaletoggle" => Command::ToggleUpscaling,
            "jump" => Command::Jump(parse_jump(arg?)?),
            _ => return None,
        };

        // Only jump takes an argument.
        if arg.is_some() && !matches!(command, Command::Jump(_)) {
            return None;
        }
        Some(command)
    }
}

fn parse_jump(arg: &str) -> Option<JumpTarget> {
    if let Some(n) = arg.strip_prefix('+') {
        return n.parse().ok().map(JumpTarget::Forward);
    }
    if let Some(n) = arg.strip_prefix('-') {
        return n.parse().ok().map(JumpTarget::Backward);
    }
    arg.parse().ok().filter(|n| *n > 0).map(JumpTarget::Absolute)
}

/// Channel used to surface command errors back to the caller.
pub type CommandResponder = oneshot::Sender<Result<(), String>>;

/// A command plus an optional reply channel for error surfacing.
#[derive(Debug)]
pub struct UserCommand {
    pub command: Command,
    pub responder: Option<CommandResponder>,
}

impl UserCommand {
    pub fn fire_and_forget(command: Command) -> Self {
        Self { command, responder: None }
    }
}

/// A custom helper executable to spawn with the viewer state in its environment.
#[derive(Debug)]
pub struct Executable {
    pub path: String,
    pub responder: Option<CommandResponder>,
}

/// Session toggles reflected in every state snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Modes {
    pub manga: bool,
    pub upscaling: bool,
}

/// Snapshot of the displayed page, shipped to the renderer.
#[derive(Debug, Clone, Default)]
pub struct State {
    pub image: Option<Arc<PremulImage>>,
    pub original_bounds: ImageDimensions,
    /// 1-indexed; 0 for an empty archive.
    pub page_number: usize,
    pub page_name: String,
    pub archive_len: usize,
    pub archive_name: String,
    pub modes: Modes,
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        let same_image = match (&self.image, &other.image) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        same_image
            && self.original_bounds == other.original_bounds
            && self.page_number == other.page_number
            && self.page_name == other.page_name
            && self.archive_len == other.archive_len
            && self.archive_name == other.archive_name
            && self.modes == other.modes
    }
}
