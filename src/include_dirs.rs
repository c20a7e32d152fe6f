//! The include-directory part of a compiler command line.

/// Include directories and forced includes, all as absolute paths, in the
/// order they appeared on the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncludeDirs {
    /// `-I dir`
    pub dirs_i: Vec<String>,
    /// `-iquote dir`
    pub dirs_iquote: Vec<String>,
    /// `-isystem dir`
    pub dirs_isystem: Vec<String>,
    /// `-include file`
    pub files_i: Vec<String>,
}

impl IncludeDirs {
    pub fn is_empty(&self) -> bool {
        self.dirs_i.is_empty() && self.dirs_iquote.is_empty() && self.dirs_isystem.is_empty()
    }

    pub fn count(&self) -> usize {
        self.dirs_i.len() + self.dirs_iquote.len() + self.dirs_isystem.len() + self.files_i.len()
    }

    /// Flatten back into `-I {dir}` pairs, in the canonical group order.
    /// This is the form sent to the worker and embedded into pch files.
    pub fn as_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(2 * self.count());
        for dir in &self.dirs_i {
            args.push("-I".to_string());
            args.push(dir.clone());
        }
        for dir in &self.dirs_iquote {
            args.push("-iquote".to_string());
            args.push(dir.clone());
        }
        for dir in &self.dirs_isystem {
            args.push("-isystem".to_string());
            args.push(dir.clone());
        }
        for file in &self.files_i {
            args.push("-include".to_string());
            args.push(file.clone());
        }
        args
    }

    /// Append another set (the compiler's default dirs after the
    /// command-line ones: lookup order must match the preprocessor's).
    pub fn merge(&mut self, other: &IncludeDirs) {
        self.dirs_i.extend(other.dirs_i.iter().cloned());
        self.dirs_iquote.extend(other.dirs_iquote.iter().cloned());
        self.dirs_isystem.extend(other.dirs_isystem.iter().cloned());
        self.files_i.extend(other.files_i.iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn as_args_preserves_group_order() {
        let dirs = IncludeDirs {
            dirs_i: vec!["/a".into()],
            dirs_iquote: vec!["/q".into()],
            dirs_isystem: vec!["/s".into()],
            files_i: vec!["/f.h".into()],
        };
        assert_eq!(
            dirs.as_args(),
            vec!["-I", "/a", "-iquote", "/q", "-isystem", "/s", "-include", "/f.h"]
        );
    }

    #[test]
    fn merge_appends_after_own_entries() {
        let mut dirs = IncludeDirs { dirs_i: vec!["/mine".into()], ..Default::default() };
        let defaults = IncludeDirs {
            dirs_i: vec!["/default".into()],
            dirs_isystem: vec!["/usr/include".into()],
            ..Default::default()
        };
        dirs.merge(&defaults);
        assert_eq!(dirs.dirs_i, vec!["/mine", "/default"]);
        assert_eq!(dirs.dirs_isystem, vec!["/usr/include"]);
    }
}
