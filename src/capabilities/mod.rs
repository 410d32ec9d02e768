pub mod clock;
pub mod database;
pub mod files;
pub mod formula;
pub mod mail;
pub mod parser;
pub mod pdf;
pub mod registry;
pub mod shell;
pub mod spreadsheet;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::args::ArgParser;

pub use clock::Clock;
pub use database::SqlClient;
pub use files::FileApi;
pub use formula::FormulaEngine;
pub use mail::MailSender;
pub use pdf::PdfExtractor;
pub use registry::{CapabilityLoader, LoadSummary};
pub use shell::Shell;
pub use spreadsheet::Spreadsheet;

/// The fixed set of capabilities a script can receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CapabilityName {
    Database,
    Clock,
    Args,
    Files,
    Spreadsheet,
    Formula,
    Pdf,
    Mail,
    Shell,
}

impl CapabilityName {
    pub const ALL: [CapabilityName; 9] = [
        CapabilityName::Database,
        CapabilityName::Clock,
        CapabilityName::Args,
        CapabilityName::Files,
        CapabilityName::Spreadsheet,
        CapabilityName::Formula,
        CapabilityName::Pdf,
        CapabilityName::Mail,
        CapabilityName::Shell,
    ];

    /// Name the capability is bound to inside the script realm.
    pub fn binding(self) -> &'static str {
        match self {
            CapabilityName::Database => "sql",
            CapabilityName::Clock => "date",
            CapabilityName::Args => "args",
            CapabilityName::Files => "fs",
            CapabilityName::Spreadsheet => "xlsx",
            CapabilityName::Formula => "xlsx_calc",
            CapabilityName::Pdf => "pdf",
            CapabilityName::Mail => "mailer",
            CapabilityName::Shell => "shell",
        }
    }

    /// Extra realm names that point at the same handle.
    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            CapabilityName::Spreadsheet => &["excel"],
            CapabilityName::Pdf => &["pdfReader"],
            CapabilityName::Mail => &["emailSender"],
            _ => &[],
        }
    }

    pub fn from_binding(name: &str) -> Option<CapabilityName> {
        Self::ALL
            .into_iter()
            .find(|c| c.binding() == name || c.aliases().contains(&name))
    }
}

impl fmt::Display for CapabilityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binding())
    }
}

/// Which capabilities must load for the run to proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strictness {
    /// Script execution: database, date helper and file helper
    Full,
    /// `--localserver` mode needs no database
    LocalServer,
}

impl Strictness {
    pub fn critical(self) -> &'static [CapabilityName] {
        match self {
            Strictness::Full => &[
                CapabilityName::Database,
                CapabilityName::Clock,
                CapabilityName::Files,
            ],
            Strictness::LocalServer => &[CapabilityName::Clock, CapabilityName::Files],
        }
    }
}

/// A live capability instance.
#[derive(Clone)]
pub enum CapabilityHandle {
    Database(Arc<SqlClient>),
    Clock(Arc<dyn Clock>),
    Args(Arc<ArgParser>),
    Files(Arc<dyn FileApi>),
    Spreadsheet(Arc<Spreadsheet>),
    Formula(Arc<FormulaEngine>),
    Pdf(Arc<PdfExtractor>),
    Mail(Arc<MailSender>),
    Shell(Arc<Shell>),
}

impl CapabilityHandle {
    pub fn name(&self) -> CapabilityName {
        match self {
            CapabilityHandle::Database(_) => CapabilityName::Database,
            CapabilityHandle::Clock(_) => CapabilityName::Clock,
            CapabilityHandle::Args(_) => CapabilityName::Args,
            CapabilityHandle::Files(_) => CapabilityName::Files,
            CapabilityHandle::Spreadsheet(_) => CapabilityName::Spreadsheet,
            CapabilityHandle::Formula(_) => CapabilityName::Formula,
            CapabilityHandle::Pdf(_) => CapabilityName::Pdf,
            CapabilityHandle::Mail(_) => CapabilityName::Mail,
            CapabilityHandle::Shell(_) => CapabilityName::Shell,
        }
    }
}

/// Something that can produce a capability handle.
///
/// `acquire` may fail; the loader then installs `fallback()` if the
/// provider has one, or records the capability as absent.
pub trait CapabilityProvider: Send + Sync {
    fn name(&self) -> CapabilityName;

    fn acquire(&self) -> anyhow::Result<CapabilityHandle>;

    /// Degraded substitute used when `acquire` fails.
    fn fallback(&self) -> Option<CapabilityHandle> {
        None
    }
}

/// Typed, read-only view of the loaded capabilities. Absent entries are
/// `None` and show up as `nil` inside the realm.
#[derive(Clone, Default)]
pub struct CapabilitySet {
    pub database: Option<Arc<SqlClient>>,
    pub clock: Option<Arc<dyn Clock>>,
    pub args: Option<Arc<ArgParser>>,
    pub files: Option<Arc<dyn FileApi>>,
    pub spreadsheet: Option<Arc<Spreadsheet>>,
    pub formula: Option<Arc<FormulaEngine>>,
    pub pdf: Option<Arc<PdfExtractor>>,
    pub mail: Option<Arc<MailSender>>,
    pub shell: Option<Arc<Shell>>,
}

impl CapabilitySet {
    pub fn insert(&mut self, handle: CapabilityHandle) {
        match handle {
            CapabilityHandle::Database(h) => self.database = Some(h),
            CapabilityHandle::Clock(h) => self.clock = Some(h),
            CapabilityHandle::Args(h) => self.args = Some(h),
            CapabilityHandle::Files(h) => self.files = Some(h),
            CapabilityHandle::Spreadsheet(h) => self.spreadsheet = Some(h),
            CapabilityHandle::Formula(h) => self.formula = Some(h),
            CapabilityHandle::Pdf(h) => self.pdf = Some(h),
            CapabilityHandle::Mail(h) => self.mail = Some(h),
            CapabilityHandle::Shell(h) => self.shell = Some(h),
        }
    }

    pub fn contains(&self, name: CapabilityName) -> bool {
        match name {
            CapabilityName::Database => self.database.is_some(),
            CapabilityName::Clock => self.clock.is_some(),
            CapabilityName::Args => self.args.is_some(),
            CapabilityName::Files => self.files.is_some(),
            CapabilityName::Spreadsheet => self.spreadsheet.is_some(),
            CapabilityName::Formula => self.formula.is_some(),
            CapabilityName::Pdf => self.pdf.is_some(),
            CapabilityName::Mail => self.mail.is_some(),
            CapabilityName::Shell => self.shell.is_some(),
        }
    }
}

/// Looks up an executable the way a shell would: paths containing a
/// separator are checked directly, bare names are searched on `PATH`.
pub fn find_executable(command: &str) -> Option<PathBuf> {
    let candidate = Path::new(command);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(command))
        .find(|p| is_executable(p))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file() || path.with_extension("exe").is_file()
}
