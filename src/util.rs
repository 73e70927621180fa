use std::backtrace::Backtrace;
use std::io::{self, Read};
use std::path::Path;
use std::time::Duration;
use log::{error, warn};
use rand::Rng;
use rocket::http::Status;
use rocket::response::status::Custom;

pub(crate) fn anyhow_to_custom_error(err: anyhow::Error) -> Custom<String> {
    error!("Error: {err:#}\nbacktrace: {}", Backtrace::capture());
    Custom(Status::InternalServerError, format!("Error: {err:#}"))
}
pub(crate) fn string_to_custom_error(err: impl ToString) -> Custom<String> {
    let err = err.to_string();
    warn!("Request error: {err}");
    Custom(Status::BadRequest, err)
}

pub(crate) fn unzip_data(bytes: &[u8]) -> Result<Vec<u8>, String> {
    let mut z = flate2::read::ZlibDecoder::new(bytes);
    let mut s = Vec::new();
    z.read_to_end(&mut s).map_err(|e| { e.to_string() })?;
    Ok(s)
}

pub fn generate_random_string(len: usize) -> String {
    const WOWELS: &str = "aeiouy";
    const CONSONANTS: &str = "bcdfghjklmnprstvz";
    let mut rng = rand::rng();
    (0..len)
        .map(|n| {
            let charset = if n % 2 == 0 { CONSONANTS.as_bytes() } else { WOWELS.as_bytes() };
            charset[rng.random_range(0..charset.len())] as char
        })
        .collect()
}

const IO_ATTEMPTS: u32 = 3;

fn is_transient(err: &io::Error) -> bool {
    matches!(err.kind(),
        io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut
        | io::ErrorKind::ResourceBusy)
}

/// Runs `op` up to three times while it fails with a transient I/O error.
pub(crate) fn retry_io<T>(what: &str, mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    let mut attempt = 1;
    loop {
        match op() {
            Err(err) if attempt < IO_ATTEMPTS && is_transient(&err) => {
                warn!("{what} failed ({err}), attempt {attempt} of {IO_ATTEMPTS}");
                std::thread::sleep(Duration::from_millis(50 * attempt as u64));
                attempt += 1;
            }
            res => return res,
        }
    }
}

pub(crate) fn write_file(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    retry_io(&format!("Writing {}", path.to_string_lossy()), || std::fs::write(path, data))?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test {
    use std::cell::Cell;
    use std::io::Read;
    use flate2::bufread::ZlibEncoder;
    use flate2::Compression;
    use super::*;

    pub(crate) fn zip_data(bytes: &[u8]) -> Result<Vec<u8>, String> {
        let mut ret_vec = Vec::new();
        let mut deflater = ZlibEncoder::new(bytes, Compression::fast());
        deflater.read_to_end(&mut ret_vec).map_err(|e| e.to_string())?;
        Ok(ret_vec)
    }

    #[test]
    fn test_zip() {
        let data = b"nombre,peso\nAna,30\n";
        let zdata = zip_data(data).unwrap();
        let udata = unzip_data(&zdata).unwrap();
        assert_eq!(udata, data);
        assert!(unzip_data(b"plain text").is_err());
    }

    #[test]
    fn retry_gives_up_after_three_transient_errors() {
        let calls = Cell::new(0);
        let res: io::Result<()> = retry_io("test", || {
            calls.set(calls.get() + 1);
            Err(io::Error::from(io::ErrorKind::Interrupted))
        });
        assert!(res.is_err());
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn retry_recovers_from_transient_error() {
        let calls = Cell::new(0);
        let res = retry_io("test", || {
            calls.set(calls.get() + 1);
            if calls.get() < 2 { Err(io::Error::from(io::ErrorKind::TimedOut)) } else { Ok(42) }
        });
        assert_eq!(res.unwrap(), 42);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn retry_does_not_repeat_permanent_errors() {
        let calls = Cell::new(0);
        let res: io::Result<()> = retry_io("test", || {
            calls.set(calls.get() + 1);
            Err(io::Error::from(io::ErrorKind::NotFound))
        });
        assert_eq!(res.unwrap_err().kind(), io::ErrorKind::NotFound);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn random_string_alternates() {
        let s = generate_random_string(8);
        assert_eq!(s.len(), 8);
        assert!(s.chars().skip(1).step_by(2).all(|c| "aeiouy".contains(c)));
    }
}
