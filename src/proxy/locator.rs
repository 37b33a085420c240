//! Proxy daemon executable discovery
//!
//! The candidate list is a pure function of the platform, an environment
//! lookup and the configured override, so it can be tested for every
//! platform from any host. Probing is a separate step with an injected
//! `exists` predicate.

use std::path::{Path, PathBuf};

/// Target platform for candidate generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    MacOs,
    /// Linux and other POSIX systems
    Unix,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Unix
        }
    }

    fn exe_name(self) -> &'static str {
        match self {
            Platform::Windows => "tor.exe",
            _ => "tor",
        }
    }

    fn path_separator(self) -> char {
        match self {
            Platform::Windows => ';',
            _ => ':',
        }
    }

    fn dir_separator(self) -> &'static str {
        match self {
            Platform::Windows => "\\",
            _ => "/",
        }
    }

    fn join(self, parts: &[&str]) -> String {
        let sep = self.dir_separator();
        let mut out = String::new();
        for (i, part) in parts.iter().enumerate() {
            let part = if i == 0 {
                part.trim_end_matches(['/', '\\'])
            } else {
                part.trim_matches(['/', '\\'])
            };
            if i > 0 {
                out.push_str(sep);
            }
            out.push_str(part);
        }
        out
    }
}

const TOR_BROWSER_TAIL: &[&str] = &["Tor Browser", "Browser", "TorBrowser", "Tor", "tor.exe"];

/// Ordered, de-duplicated list of places the daemon may be installed
///
/// When `override_path` is set it is the only candidate.
pub fn candidate_paths<F>(platform: Platform, env: F, override_path: Option<&Path>) -> Vec<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = override_path {
        return vec![path.to_path_buf()];
    }

    let exe = platform.exe_name();
    let mut candidates: Vec<String> = Vec::new();

    if let Some(path_var) = env("PATH") {
        for dir in path_var.split(platform.path_separator()).filter(|d| !d.is_empty()) {
            candidates.push(platform.join(&[dir, exe]));
            if platform == Platform::Windows {
                candidates.push(platform.join(&[dir, "tor"]));
            }
        }
    }

    candidates.push(platform.join(&[".", "tor", exe]));

    match platform {
        Platform::Windows => {
            let program_files = env("ProgramFiles").unwrap_or_else(|| r"C:\Program Files".to_string());
            let program_files_x86 =
                env("ProgramFiles(x86)").unwrap_or_else(|| r"C:\Program Files (x86)".to_string());
            let local_app_data = env("LOCALAPPDATA").or_else(|| env("LocalAppData"));
            let user_profile = env("USERPROFILE");

            candidates.push(platform.join(&[&program_files, "Tor", exe]));
            candidates.push(platform.join(&[&program_files_x86, "Tor", exe]));
            candidates.push(r"C:\Tor\tor.exe".to_string());

            let mut browser_roots = vec![Some(program_files.clone()), Some(program_files_x86.clone()), local_app_data];
            browser_roots.push(
                user_profile
                    .as_deref()
                    .map(|profile| platform.join(&[profile, "AppData", "Local", "Programs"])),
            );
            for root in browser_roots.into_iter().flatten() {
                let mut parts = vec![root.as_str()];
                parts.extend_from_slice(TOR_BROWSER_TAIL);
                candidates.push(platform.join(&parts));
            }

            if let Some(profile) = user_profile.as_deref() {
                let mut desktop = vec![profile, "Desktop"];
                desktop.extend_from_slice(TOR_BROWSER_TAIL);
                candidates.push(platform.join(&desktop));

                let one_drive = env("OneDrive").unwrap_or_else(|| platform.join(&[profile, "OneDrive"]));
                let mut redirected = vec![one_drive.as_str(), "Desktop"];
                redirected.extend_from_slice(TOR_BROWSER_TAIL);
                candidates.push(platform.join(&redirected));

                candidates.push(platform.join(&[profile, "scoop", "apps", "tor", "current", "bin", exe]));
            }

            candidates.push(r"C:\ProgramData\chocolatey\bin\tor.exe".to_string());
            candidates.push(r"C:\ProgramData\chocolatey\lib\tor\tools\tor.exe".to_string());
        }
        Platform::MacOs | Platform::Unix => {
            for path in ["/usr/bin/tor", "/usr/local/bin/tor", "/opt/homebrew/bin/tor", "/opt/local/bin/tor"] {
                candidates.push(path.to_string());
            }
            if platform == Platform::MacOs {
                candidates.push("/Applications/Tor Browser.app/Contents/MacOS/Tor/tor".to_string());
                if let Some(home) = env("HOME") {
                    candidates.push(platform.join(&[
                        &home,
                        "Applications",
                        "Tor Browser.app",
                        "Contents",
                        "MacOS",
                        "Tor",
                        "tor",
                    ]));
                }
            }
        }
    }

    let mut seen = std::collections::HashSet::new();
    candidates
        .into_iter()
        .filter(|c| seen.insert(c.clone()))
        .map(PathBuf::from)
        .collect()
}

/// First candidate accepted by `exists`
pub fn locate<F>(candidates: &[PathBuf], exists: F) -> Option<PathBuf>
where
    F: Fn(&Path) -> bool,
{
    candidates.iter().find(|p| exists(p)).cloned()
}

/// `exists` predicate for real filesystems: a regular file, executable on Unix
pub fn is_executable_file(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}
