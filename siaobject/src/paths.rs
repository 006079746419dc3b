use anyhow::{bail, Context, Result};
use std::env;
use std::path::{Path, PathBuf};

const APP_NAME: &str = "sia-nbdserver";

/// Where cache files live: `$XDG_DATA_HOME/sia-nbdserver`, falling back to
/// `~/.local/share/sia-nbdserver`.
pub fn data_directory() -> Result<PathBuf> {
    match env::var("XDG_DATA_HOME") {
        Ok(dir) if !dir.is_empty() => Ok(PathBuf::from(dir).join(APP_NAME)),
        _ => {
            let home = env::var("HOME").context("$HOME not set")?;
            Ok(PathBuf::from(home).join(".local/share").join(APP_NAME))
        }
    }
}

pub fn default_socket_path() -> Result<PathBuf> {
    match env::var("XDG_RUNTIME_DIR") {
        Ok(dir) if !dir.is_empty() => Ok(PathBuf::from(dir).join(APP_NAME)),
        _ => bail!("$XDG_RUNTIME_DIR not set; specify a socket path"),
    }
}

pub fn default_password_file() -> Result<PathBuf> {
    let home = env::var("HOME").context("$HOME not set")?;
    Ok(PathBuf::from(home).join(".sia/apipassword"))
}

pub fn read_password_file(path: &Path) -> Result<String> {
    let password = std::fs::read_to_string(path)
        .with_context(|| format!("reading password file {}", path.display()))?;
    Ok(password.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_password_is_trimmed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "  s3cret  ").unwrap();
        assert_eq!(read_password_file(file.path()).unwrap(), "s3cret");
    }

    #[test]
    fn test_missing_password_file_is_an_error() {
        assert!(read_password_file(Path::new("/nonexistent/apipassword")).is_err());
    }
}
