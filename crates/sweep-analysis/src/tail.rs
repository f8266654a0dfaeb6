use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

const INITIAL_WINDOW: u64 = 8 * 1024;

/// Last `n` lines of a file, oldest first, without reading the whole file.
/// A trailing newline does not count as an extra empty line.
pub fn read_tail_lines(path: &Path, n: usize) -> io::Result<Vec<String>> {
    if n == 0 {
        return Ok(Vec::new());
    }
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let mut window = INITIAL_WINDOW.min(len);
    loop {
        let start = len - window;
        file.seek(SeekFrom::Start(start))?;
        let mut buf = Vec::with_capacity(window as usize);
        (&mut file).take(window).read_to_end(&mut buf)?;
        let text = String::from_utf8_lossy(&buf);
        let body = text.strip_suffix('\n').unwrap_or(&text);
        let mut lines: Vec<&str> = body.split('\n').collect();
        // The first line may be cut in half unless the window reaches the start.
        let complete = if start == 0 { lines.len() } else { lines.len().saturating_sub(1) };
        if complete >= n || start == 0 {
            if start > 0 {
                lines.remove(0);
            }
            let skip = lines.len().saturating_sub(n);
            return Ok(lines[skip..]
                .iter()
                .map(|l| l.trim_end_matches('\r').to_string())
                .collect());
        }
        window = (window * 4).min(len);
    }
}
