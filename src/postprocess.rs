//! Decryption of downloaded files with an external tool.
//!
//! Files protected by a content decryption module are downloaded as they
//! are served and decrypted afterwards by `mp4decrypt`, given every
//! `kid:key` pair of the license. The original file is never lost: when the
//! tool fails, the encrypted file is put back and the command to run by
//! hand is logged.

use std::{
    env, fs,
    path::{Path, PathBuf},
    process::Command,
};

use crate::{
    error::{Error, Result},
    key_provider::CdmKey,
    uuid::Uuid,
};

/// Name of the tool executable, without suffix.
pub const TOOL_NAME: &str = "mp4decrypt";

/// Runs `mp4decrypt` over downloaded files.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Mp4Decrypt {
    tool: Option<PathBuf>,
}

impl Mp4Decrypt {
    /// Uses the tool at `explicit`, or else the first one on `PATH`.
    #[must_use]
    pub fn locate(explicit: Option<&Path>) -> Self {
        if let Some(path) = explicit {
            if path.is_file() {
                return Self {
                    tool: Some(path.to_path_buf()),
                };
            }
            warn!("{} not found, searching PATH", path.display());
        }

        let executable = format!("{TOOL_NAME}{}", env::consts::EXE_SUFFIX);
        let tool = env::var_os("PATH").and_then(|paths| {
            env::split_paths(&paths)
                .map(|dir| dir.join(&executable))
                .find(|candidate| candidate.is_file())
        });

        match tool {
            Some(ref tool) => debug!("using {}", tool.display()),
            None => debug!("{TOOL_NAME} not found"),
        }
        Self { tool }
    }

    #[must_use]
    pub fn tool(&self) -> Option<&Path> {
        self.tool.as_deref()
    }

    /// Shell command line decrypting `input` into `output`.
    #[must_use]
    pub fn command_line(&self, keys: &[CdmKey], input: &Path, output: &Path) -> String {
        let tool = self
            .tool
            .as_deref()
            .map_or_else(|| TOOL_NAME.to_owned(), |tool| tool.display().to_string());

        let mut line = shell_quote(&tool);
        for key in keys {
            line.push_str(&format!(" --key {}", shell_quote(&key.to_string())));
        }
        for path in [input, output] {
            line.push(' ');
            line.push_str(&shell_quote(&path.display().to_string()));
        }
        line
    }

    /// Decrypts `path` in place.
    ///
    /// Returns `false` without touching the file if the tool is not
    /// installed.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the tool fails. The encrypted file is restored
    /// first.
    pub fn decrypt(&self, path: &Path, keys: &[CdmKey]) -> Result<bool> {
        let Some(ref tool) = self.tool else {
            warn!(
                "{TOOL_NAME} is not installed, {} stays encrypted; decrypt it with:\n{}",
                path.display(),
                self.command_line(keys, path, &decrypted_name(path)),
            );
            return Ok(false);
        };

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let id = Uuid::fast_v4();
        let input = dir.join(format!("tmp_{id}.mp4"));
        let output = dir.join(format!("tmp_{id}_out.mp4"));

        fs::rename(path, &input)?;

        let result = run(tool, keys, &input, &output)
            .and_then(|()| fs::rename(&output, path).map_err(Into::into));

        match result {
            Ok(()) => {
                fs::remove_file(&input)?;
                info!("decrypted {}", path.display());
                Ok(true)
            }
            Err(e) => {
                let _ = fs::remove_file(&output);
                fs::rename(&input, path)?;

                error!("decrypting {} failed: {e}", path.display());
                info!(
                    "decrypt it by hand with:\n{}",
                    self.command_line(keys, path, &decrypted_name(path)),
                );
                Err(Error::internal(format!("{TOOL_NAME}: {e}")))
            }
        }
    }
}

/// Quotes `word` for a POSIX shell. Words made of safe characters only are
/// left alone.
fn shell_quote(word: &str) -> String {
    let safe = |c: char| c.is_ascii_alphanumeric() || "@%+=:,./_-".contains(c);
    if !word.is_empty() && word.chars().all(safe) {
        return word.to_owned();
    }
    format!("'{}'", word.replace('\'', r#"'"'"'"#))
}

fn run(tool: &Path, keys: &[CdmKey], input: &Path, output: &Path) -> Result<()> {
    let mut command = Command::new(tool);
    for key in keys {
        command.arg("--key").arg(key.to_string());
    }
    command.arg(input).arg(output);

    let result = command.output()?;
    if !result.status.success() {
        return Err(Error::internal(format!(
            "{}: {}",
            result.status,
            String::from_utf8_lossy(&result.stderr).trim()
        )));
    }
    if !output.is_file() {
        return Err(Error::internal("no output written"));
    }

    Ok(())
}

fn decrypted_name(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map_or_else(String::new, |stem| stem.to_string_lossy().into_owned());
    path.with_file_name(format!("{stem}_decrypted.mp4"))
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn keys() -> Vec<CdmKey> {
        vec![
            "00112233445566778899aabbccddeeff:ffeeddccbbaa99887766554433221100"
                .parse()
                .unwrap(),
            "0a0b:0c0d".parse().unwrap(),
        ]
    }

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-mp4decrypt");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn leftovers(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("tmp_"))
            .collect()
    }

    #[test]
    fn replaces_file_with_tool_output() {
        let dir = tempfile::tempdir().unwrap();
        // Uppercases the input and records the arguments.
        let tool = script(
            dir.path(),
            &format!(
                "echo \"$@\" > {}/args\nfor arg; do prev=$cur; cur=$arg; done\ntr a-z A-Z < \"$prev\" > \"$cur\"",
                dir.path().display()
            ),
        );
        let media = dir.path().join("song.mp4");
        fs::write(&media, "encrypted").unwrap();

        let decrypt = Mp4Decrypt::locate(Some(&tool));
        assert_eq!(decrypt.tool(), Some(tool.as_path()));
        assert!(decrypt.decrypt(&media, &keys()).unwrap());

        assert_eq!(fs::read_to_string(&media).unwrap(), "ENCRYPTED");
        assert!(leftovers(dir.path()).is_empty());

        let args = fs::read_to_string(dir.path().join("args")).unwrap();
        assert!(args.starts_with(
            "--key 00112233445566778899aabbccddeeff:ffeeddccbbaa99887766554433221100 --key 0a0b:0c0d "
        ));
    }

    #[test]
    fn failure_restores_original() {
        let dir = tempfile::tempdir().unwrap();
        let tool = script(dir.path(), "for arg; do cur=$arg; done\necho partial > \"$cur\"\nexit 1");
        let media = dir.path().join("song.mp4");
        fs::write(&media, "encrypted").unwrap();

        let err = Mp4Decrypt::locate(Some(&tool))
            .decrypt(&media, &keys())
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Internal);
        assert_eq!(fs::read_to_string(&media).unwrap(), "encrypted");
        assert!(leftovers(dir.path()).is_empty());
    }

    #[test]
    fn missing_tool_leaves_file() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("song.mp4");
        fs::write(&media, "encrypted").unwrap();

        let decrypt = Mp4Decrypt::default();
        assert!(!decrypt.decrypt(&media, &keys()).unwrap());
        assert_eq!(fs::read_to_string(&media).unwrap(), "encrypted");
    }

    #[test]
    fn command_line_lists_every_key() {
        let line = Mp4Decrypt::default().command_line(
            &keys(),
            Path::new("in.mp4"),
            Path::new("out.mp4"),
        );
        assert_eq!(
            line,
            "mp4decrypt --key 00112233445566778899aabbccddeeff:ffeeddccbbaa99887766554433221100 \
             --key 0a0b:0c0d in.mp4 out.mp4"
        );
    }

    #[test]
    fn command_line_quotes_shell_characters() {
        let decrypt = Mp4Decrypt {
            tool: Some(PathBuf::from("/opt/bento 4/mp4decrypt")),
        };
        let line = decrypt.command_line(
            &keys()[1..],
            Path::new("/music/$HOME \"live\".mp4"),
            Path::new("/music/it's.mp4"),
        );
        assert_eq!(
            line,
            r#"'/opt/bento 4/mp4decrypt' --key 0a0b:0c0d '/music/$HOME "live".mp4' '/music/it'"'"'s.mp4'"#
        );
        assert_eq!(shell_quote(""), "''");
    }
}
