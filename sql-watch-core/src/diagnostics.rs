//! Maps a PostgreSQL error position back to a script line and renders the
//! surrounding lines for the log.

use log::Level;

use crate::error::DbError;

/// Width of the right-aligned line number column.
const LINE_NUMBER_WIDTH: usize = 6;

/// Where in a script an error was reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    /// 1-based line number, 0 when unknown.
    pub line_number: usize,
    /// 0-based index of the highlighted line. Values <= 0 mean no line is highlighted.
    pub error_index: isize,
}

/// Locate the line for a 1-based character `position` within `script`.
///
/// Line lengths are summed without their newlines. The first line whose
/// running total exceeds `position` is found, and the line before it is
/// reported.
pub fn locate(script: &str, position: u32) -> Location {
    let position = position as usize;
    let mut total = 0usize;
    let mut error_index: isize = 0;
    for (i, line) in script.split('\n').enumerate() {
        total += line.chars().count();
        if total > position {
            error_index = i as isize - 1;
            break;
        }
    }

    let line_number = if error_index > 0 {
        error_index as usize + 1
    } else {
        0
    };
    Location {
        line_number,
        error_index,
    }
}

fn number_line(index: usize, text: &str) -> String {
    format!("{:>width$}: {}", index + 1, text, width = LINE_NUMBER_WIDTH)
}

/// Put a `*` in the leading padding, keeping the line the same width as its
/// neighbours once the longer `ERROR` level prefix is added.
fn mark_line(numbered: &str) -> String {
    numbered.replacen(' ', "*", 1).replacen(' ', "", 1)
}

/// Render the numbered lines to log for a located error.
///
/// Verbose renders every line. Otherwise only the highlighted line and its
/// neighbours are rendered, and nothing when the line is unknown.
pub fn render(script: &str, location: Location, verbose: bool) -> Vec<(Level, String)> {
    let error_index = if location.error_index > 0 {
        Some(location.error_index as usize)
    } else {
        None
    };
    let lines: Vec<String> = script
        .split('\n')
        .enumerate()
        .map(|(i, text)| {
            let numbered = number_line(i, text);
            if Some(i) == error_index {
                mark_line(&numbered)
            } else {
                numbered
            }
        })
        .collect();

    if verbose {
        return lines
            .into_iter()
            .enumerate()
            .map(|(i, line)| {
                let level = if Some(i) == error_index {
                    Level::Error
                } else {
                    Level::Info
                };
                (level, line)
            })
            .collect();
    }

    let Some(at) = error_index else {
        return Vec::new();
    };
    let mut rendered = Vec::new();
    if at > 1 {
        rendered.push((Level::Info, lines[at - 1].clone()));
    }
    if let Some(line) = lines.get(at) {
        rendered.push((Level::Error, line.clone()));
    }
    if let Some(line) = lines.get(at + 1) {
        rendered.push((Level::Info, line.clone()));
    }
    rendered
}

/// Log a failed script: a header with file, line and error, then the context lines.
pub fn report(file: &str, script: &str, error: &DbError, verbose: bool) {
    let location = locate(script, error.position.unwrap_or(0));
    log::error!(
        "{}:{} {} ({}) {}",
        file,
        location.line_number,
        error.kind,
        error.code,
        error.message
    );
    if location.line_number == 0 {
        log::warn!("Unable to determine error line number.");
    }
    for (level, line) in render(script, location, verbose) {
        log::log!(level, "{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = "select 1;\nselect 2;\nselec 3;\nselect 4;\nselect 5;\nselect 6;";

    #[test]
    fn test_locate_reports_line_before_overflow() {
        // "selec" starts line 3, at character 21.
        let position = SCRIPT.find("selec 3").unwrap() as u32 + 1;
        assert_eq!(position, 21);

        let location = locate(SCRIPT, position);
        assert_eq!(location.error_index, 1);
        assert_eq!(location.line_number, 2);
    }

    #[test]
    fn test_locate_later_line() {
        let location = locate(SCRIPT, 40);
        assert_eq!(location.error_index, 3);
        assert_eq!(location.line_number, 4);
    }

    #[test]
    fn test_locate_first_line_is_unknown() {
        let location = locate(SCRIPT, 5);
        assert_eq!(location.error_index, -1);
        assert_eq!(location.line_number, 0);

        // Overflow on the second line gives index 0, also unknown.
        assert_eq!(locate(SCRIPT, 12).line_number, 0);
    }

    #[test]
    fn test_locate_past_end_is_unknown() {
        let location = locate(SCRIPT, 500);
        assert_eq!(location.line_number, 0);
    }

    #[test]
    fn test_locate_counts_characters() {
        let script = "-- ünïcödé\n-- ünïcödé\nselect;\nbad";
        // 10 characters (16 bytes) per comment line
        assert_eq!(locate(script, 22).line_number, 2);
    }

    #[test]
    fn test_mark_line_keeps_width() {
        assert_eq!(number_line(1, "select 2;"), "     2: select 2;");
        assert_eq!(mark_line("     2: select 2;"), "*   2: select 2;");
        assert_eq!(mark_line("   123: x"), "* 123: x");
    }

    #[test]
    fn test_render_context_window() {
        let rendered = render(SCRIPT, locate(SCRIPT, 40), false);
        assert_eq!(
            rendered,
            vec![
                (Level::Info, "     3: selec 3;".to_string()),
                (Level::Error, "*   4: select 4;".to_string()),
                (Level::Info, "     5: select 5;".to_string()),
            ]
        );
    }

    #[test]
    fn test_render_second_line_has_no_before_context() {
        let rendered = render(SCRIPT, locate(SCRIPT, 21), false);
        assert_eq!(
            rendered,
            vec![
                (Level::Error, "*   2: select 2;".to_string()),
                (Level::Info, "     3: selec 3;".to_string()),
            ]
        );
    }

    #[test]
    fn test_render_highlighted_line_always_has_a_successor() {
        let script = "a\nbb\nccc\ndddd";
        let location = locate(script, 7);
        assert_eq!(location.line_number, 3);
        assert_eq!(
            render(script, location, false),
            vec![
                (Level::Info, "     2: bb".to_string()),
                (Level::Error, "*   3: ccc".to_string()),
                (Level::Info, "     4: dddd".to_string()),
            ]
        );
    }

    #[test]
    fn test_render_verbose_whole_file() {
        let rendered = render(SCRIPT, locate(SCRIPT, 40), true);
        assert_eq!(rendered.len(), 6);
        let errors: Vec<_> = rendered
            .iter()
            .filter(|(level, _)| *level == Level::Error)
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].1, "*   4: select 4;");
        assert_eq!(rendered[0], (Level::Info, "     1: select 1;".to_string()));
    }

    #[test]
    fn test_render_unknown_line() {
        let location = locate(SCRIPT, 5);
        assert!(render(SCRIPT, location, false).is_empty());
        let verbose = render(SCRIPT, location, true);
        assert_eq!(verbose.len(), 6);
        assert!(verbose.iter().all(|(level, _)| *level == Level::Info));
    }
}
