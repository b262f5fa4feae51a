/*
 * Created on Thu Mar 13 2025
 *
 * This file is a part of Vigil
 * Vigil is a free and open-source centralized audit log receiver that
 * records privileged command sessions into durable, relayable artifacts
 * without compromising on integrity or operability.
 *
 * Copyright (c) 2025, The Vigil Authors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

// unix imports
#[cfg(unix)]
extern crate libc;

#[cfg(unix)]
pub use unix::*;

#[cfg(unix)]
mod unix {
    use {
        rand::{distributions::Alphanumeric, Rng},
        std::{
            fs::{self, DirBuilder, File, OpenOptions},
            io::{self, Error as IoError, ErrorKind},
            os::unix::{
                fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt},
                io::AsRawFd,
            },
            path::{Path, PathBuf},
        },
    };

    /// Attempts before a unique-name template is declared exhausted
    const TEMPLATE_ATTEMPTS: usize = 64;
    /// Randomized characters in a unique-name template
    const TEMPLATE_RANDOM: usize = 6;

    /// Take an exclusive advisory lock on an open file without blocking
    pub fn lock_exclusive(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};
        let result = unsafe { flock(file.as_raw_fd(), LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(IoError::new(
                ErrorKind::AlreadyExists,
                "file is already locked",
            ));
        }
        Ok(())
    }

    /// Create every missing directory of `path` with the given mode
    pub fn create_dir_tree(path: &Path, mode: u32) -> io::Result<()> {
        DirBuilder::new().recursive(true).mode(mode).create(path)
    }

    fn random_suffix() -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TEMPLATE_RANDOM)
            .map(char::from)
            .collect()
    }

    /// Create a uniquely named file `<dir>/<prefix>.XXXXXX` with the given
    /// mode, opened read+write. The name is randomized per attempt; a
    /// collision simply retries until the template is exhausted.
    pub fn create_unique_file(
        dir: &Path,
        prefix: &str,
        mode: u32,
    ) -> io::Result<(File, PathBuf)> {
        for _ in 0..TEMPLATE_ATTEMPTS {
            let path = dir.join(format!("{}.{}", prefix, random_suffix()));
            match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .mode(mode)
                .open(&path)
            {
                Ok(f) => return Ok((f, path)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
        Err(IoError::new(
            ErrorKind::AlreadyExists,
            "unique file name template exhausted",
        ))
    }

    /// Remove the write bits (`chmod a-w`) from the file at `path`
    pub fn clear_write_bits(path: &Path) -> io::Result<()> {
        let md = fs::metadata(path)?;
        let mut perms = md.permissions();
        perms.set_mode(perms.mode() & !0o222);
        fs::set_permissions(path, perms)
    }

    /// This host's name, for log identifiers handed to clients
    pub fn hostname() -> String {
        let mut buf = [0u8; 256];
        let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
        if ret != 0 {
            return "localhost".to_owned();
        }
        let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
        String::from_utf8_lossy(&buf[..end]).into_owned()
    }

    #[test]
    fn test_unique_file_template() {
        let dir = std::env::temp_dir();
        let (_f1, p1) = create_unique_file(&dir, "vigil-ut", 0o600).unwrap();
        let (_f2, p2) = create_unique_file(&dir, "vigil-ut", 0o600).unwrap();
        assert_ne!(p1, p2);
        let _ = fs::remove_file(p1);
        let _ = fs::remove_file(p2);
    }
}
