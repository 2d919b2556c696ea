use crate::bridge::{AddressFilter, FilterKind};
use crate::elf::ElfImage;
use crate::error::CreteError;
use crate::procmap::ProcessMemoryMap;
use log::{debug, warn};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

/// Resolves a short library name (`libc.so.6`) or a full path against the
/// files mapped into the process.
///
/// An exact full-path match wins immediately. Otherwise every mapping whose
/// file name matches is collected: none is a not-found error, matches that
/// disagree on the absolute path are ambiguous, and several segments of the
/// same file are fine.
pub fn deduce_library(short_name: &str, map: &ProcessMemoryMap) -> Result<PathBuf, CreteError> {
    let wanted = Path::new(short_name);
    let mut matched: Option<&Path> = None;

    for entry in map.entries() {
        let Some(path) = entry.path.as_deref() else {
            continue;
        };
        if path == wanted {
            return Ok(path.to_path_buf());
        }
        if entry.file_name() == Some(wanted.as_os_str()) {
            if let Some(previous) = matched {
                if previous != path {
                    return Err(CreteError::AmbiguousLibrary {
                        name: short_name.to_string(),
                        first: previous.to_path_buf(),
                        second: path.to_path_buf(),
                    });
                }
            }
            matched = Some(path);
        }
    }

    matched
        .map(Path::to_path_buf)
        .ok_or_else(|| CreteError::LibraryNotFound(short_name.to_string()))
}

/// Maps named sections to absolute ranges. Sections that are absent or have
/// a zero address are skipped.
pub fn resolve_sections<'a>(
    image: &ElfImage,
    names: impl IntoIterator<Item = &'a String>,
    base_address: u64,
    kind: FilterKind,
) -> Vec<AddressFilter> {
    names
        .into_iter()
        .filter_map(|name| image.section(name))
        .filter(|section| section.address != 0)
        .map(|section| {
            let start = base_address + section.address;
            AddressFilter::new(start, start + section.size, kind)
        })
        .collect()
}

/// Turns the symbolic targets of a run configuration into concrete address
/// filters for one captured process map.
pub struct AddressResolver<'m> {
    map: &'m ProcessMemoryMap,
    executable: PathBuf,
    images: HashMap<PathBuf, ElfImage>,
}

impl<'m> AddressResolver<'m> {
    pub fn new(map: &'m ProcessMemoryMap, executable: &Path) -> Self {
        Self {
            map,
            executable: executable.to_path_buf(),
            images: HashMap::new(),
        }
    }

    fn image(&mut self, path: &Path) -> Result<&ElfImage, CreteError> {
        if !self.images.contains_key(path) {
            let image = ElfImage::load(path)?;
            self.images.insert(path.to_path_buf(), image);
        }
        Ok(&self.images[path])
    }

    /// Runtime load bias of `image`: the mapped base for relocatable images,
    /// zero for fixed-address executables.
    fn load_bias(&self, image_path: &Path, relocatable: bool) -> u64 {
        if !relocatable {
            return 0;
        }
        if let Some(base) = self.map.base_address(image_path) {
            return base;
        }
        // The map may name the executable by its canonical path.
        image_path
            .canonicalize()
            .ok()
            .and_then(|canonical| self.map.base_address(&canonical))
            .unwrap_or_else(|| {
                warn!(
                    "{:?} is position independent but not in the process map; using link-time addresses",
                    image_path
                );
                0
            })
    }

    pub fn deduce_library(&self, short_name: &str) -> Result<PathBuf, CreteError> {
        deduce_library(short_name, self.map)
    }

    /// One filter per mapped segment of the library.
    pub fn resolve_library_ranges(
        &self,
        short_name: &str,
        kind: FilterKind,
    ) -> Result<Vec<AddressFilter>, CreteError> {
        let path = self.deduce_library(short_name)?;
        let filters: Vec<AddressFilter> = self
            .map
            .find(&path)
            .into_iter()
            .map(|e| AddressFilter::new(e.start, e.end, kind))
            .collect();

        if filters.is_empty() {
            return Err(CreteError::LibraryNotFound(short_name.to_string()));
        }
        Ok(filters)
    }

    /// Resolves `name` in the executable (`lib` absent) or in a mapped
    /// library. A symbol that cannot be found yields a zero-width filter and
    /// a warning; stripped binaries are expected.
    pub fn resolve_function(
        &mut self,
        name: &str,
        lib: Option<&str>,
        kind: FilterKind,
    ) -> Result<AddressFilter, CreteError> {
        let (image_path, symbol, relocatable) = match lib {
            None => {
                let executable = self.executable.clone();
                let image = self.image(&executable)?;
                if !image.has_symtab() {
                    warn!(
                        "failed to get address of '{}' - ensure binary has a symbol table '.symtab'",
                        name
                    );
                    return Ok(AddressFilter::empty(kind));
                }
                let symbol = image.symtab_symbol(name);
                (executable, symbol, image.is_relocatable())
            }
            Some(lib) => {
                let path = self.deduce_library(lib)?;
                let image = self.image(&path)?;
                // Mapped libraries are always rebased, whatever their type.
                (path, image.symbol(name), true)
            }
        };

        let Some(symbol) = symbol else {
            warn!(
                "failed to get address of '{}' in {:?}; registering an empty filter",
                name, image_path
            );
            return Ok(AddressFilter::empty(kind));
        };

        let base = self.load_bias(&image_path, relocatable);
        let start = base + symbol.address;
        Ok(AddressFilter::new(start, start + symbol.size, kind))
    }

    /// Filters for the named sections of every ELF image present in the
    /// process map, each rebased by its own load bias. Mapped files that are
    /// gone or are not ELF images are skipped.
    pub fn resolve_mapped_sections(
        &mut self,
        names: &BTreeSet<String>,
        kind: FilterKind,
    ) -> Vec<AddressFilter> {
        if names.is_empty() {
            return Vec::new();
        }

        let paths: Vec<PathBuf> = self
            .map
            .backing_paths()
            .into_iter()
            .filter(|p| p.exists())
            .map(Path::to_path_buf)
            .collect();

        let mut filters = Vec::new();
        for path in paths {
            let relocatable = match self.image(&path) {
                Ok(image) => image.is_relocatable(),
                Err(e) => {
                    debug!("Skipping mapped file {:?}: {}", path, e);
                    continue;
                }
            };
            let base = self.load_bias(&path, relocatable);
            let image = &self.images[&path];
            filters.extend(resolve_sections(image, names, base, kind));
        }
        filters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::{LevelFilter, Log, Metadata, Record};
    use std::sync::{Mutex, Once};

    fn map_of(lines: &[&str]) -> ProcessMemoryMap {
        ProcessMemoryMap::parse(&lines.join("\n")).unwrap()
    }

    /// Where the tests pretend the loader placed the test binary.
    const EXE_BASE: u64 = 0x555555554000;

    /// The test binary mapped at `EXE_BASE`, the way the loader lays out a PIE.
    fn exe_at_base() -> (PathBuf, ProcessMemoryMap) {
        let exe = std::env::current_exe().unwrap();
        let line = format!(
            "{:x}-{:x} r-xp 00000000 08:02 4242 {}",
            EXE_BASE,
            EXE_BASE + 0x100000,
            exe.display()
        );
        let map = map_of(&[HEAP, line.as_str()]);
        (exe, map)
    }

    static WARNINGS: Mutex<Vec<String>> = Mutex::new(Vec::new());

    struct WarningLog;

    impl Log for WarningLog {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= log::Level::Warn
        }

        fn log(&self, record: &Record) {
            if self.enabled(record.metadata()) {
                WARNINGS.lock().unwrap().push(record.args().to_string());
            }
        }

        fn flush(&self) {}
    }

    static LOGGER: WarningLog = WarningLog;

    /// Warnings logged so far that mention `needle`.
    fn warnings_about(needle: &str) -> usize {
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            if log::set_logger(&LOGGER).is_ok() {
                log::set_max_level(LevelFilter::Warn);
            }
        });
        WARNINGS
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w.contains(needle))
            .count()
    }

    const LIBC_A: &str =
        "7ffff7dc3000-7ffff7de9000 r--p 00000000 08:02 2231 /usr/lib/x86_64-linux-gnu/libc.so.6";
    const LIBC_A_TEXT: &str =
        "7ffff7de9000-7ffff7f3e000 r-xp 00026000 08:02 2231 /usr/lib/x86_64-linux-gnu/libc.so.6";
    const LIBC_B: &str = "7ffff7a00000-7ffff7a20000 r--p 00000000 08:02 9999 /opt/alt/libc.so.6";
    const PROG: &str = "00400000-00401000 r-xp 00000000 08:02 1049 /opt/target/bin/prog";
    const HEAP: &str = "01d6f000-01d90000 rw-p 00000000 00:00 0 [heap]";

    #[test]
    fn single_match_by_file_name_is_deduced() {
        let map = map_of(&[PROG, HEAP, LIBC_A]);
        assert_eq!(
            deduce_library("libc.so.6", &map).unwrap(),
            PathBuf::from("/usr/lib/x86_64-linux-gnu/libc.so.6")
        );
    }

    #[test]
    fn full_path_match_returns_immediately() {
        let map = map_of(&[LIBC_A, LIBC_B]);
        assert_eq!(
            deduce_library("/opt/alt/libc.so.6", &map).unwrap(),
            PathBuf::from("/opt/alt/libc.so.6")
        );
    }

    #[test]
    fn same_name_different_paths_is_ambiguous() {
        let map = map_of(&[LIBC_A, LIBC_B]);
        match deduce_library("libc.so.6", &map) {
            Err(CreteError::AmbiguousLibrary { name, .. }) => assert_eq!(name, "libc.so.6"),
            other => panic!("Expected AmbiguousLibrary, got {other:?}"),
        }
    }

    #[test]
    fn several_segments_of_one_library_are_not_ambiguous() {
        let map = map_of(&[LIBC_A, HEAP, LIBC_A_TEXT]);
        assert!(deduce_library("libc.so.6", &map).is_ok());
    }

    #[test]
    fn unknown_library_is_not_found() {
        let map = map_of(&[PROG, HEAP, LIBC_A]);
        assert!(matches!(
            deduce_library("libz.so.1", &map),
            Err(CreteError::LibraryNotFound(name)) if name == "libz.so.1"
        ));
    }

    #[test]
    fn library_ranges_cover_every_segment() {
        let map = map_of(&[PROG, LIBC_A, HEAP, LIBC_A_TEXT]);
        let resolver = AddressResolver::new(&map, Path::new("/opt/target/bin/prog"));
        let filters = resolver
            .resolve_library_ranges("libc.so.6", FilterKind::Include)
            .unwrap();
        assert_eq!(
            filters,
            vec![
                AddressFilter::new(0x7ffff7dc3000, 0x7ffff7de9000, FilterKind::Include),
                AddressFilter::new(0x7ffff7de9000, 0x7ffff7f3e000, FilterKind::Include),
            ]
        );
    }

    #[test]
    fn missing_executable_symbol_degrades_to_an_empty_filter() {
        let exe = std::env::current_exe().unwrap();
        let map = ProcessMemoryMap::default();
        let mut resolver = AddressResolver::new(&map, &exe);

        let filter = resolver
            .resolve_function("definitely_not_a_symbol_name", None, FilterKind::Exclude)
            .unwrap();
        assert_eq!(filter, AddressFilter::empty(FilterKind::Exclude));
        assert!(filter.is_empty());
    }

    #[test]
    fn executable_symbol_is_rebased_by_the_load_bias() {
        let (exe, map) = exe_at_base();
        let mut resolver = AddressResolver::new(&map, &exe);

        let image = ElfImage::load(&exe).unwrap();
        let main = image.symtab_symbol("main").expect("test binary keeps main");
        let bias = if image.is_relocatable() { EXE_BASE } else { 0 };

        let filter = resolver
            .resolve_function("main", None, FilterKind::Include)
            .unwrap();
        assert_eq!(
            filter,
            AddressFilter::new(
                bias + main.address,
                bias + main.address + main.size,
                FilterKind::Include
            )
        );
    }

    #[test]
    fn library_symbol_is_offset_from_the_mapped_base() {
        let (exe, map) = exe_at_base();
        let short_name = exe.file_name().unwrap().to_str().unwrap().to_string();
        let mut resolver = AddressResolver::new(&map, Path::new("/opt/target/bin/prog"));

        let image = ElfImage::load(&exe).unwrap();
        let main = image.symbol("main").unwrap();

        let filter = resolver
            .resolve_function("main", Some(&short_name), FilterKind::Exclude)
            .unwrap();
        assert_eq!(filter.start, EXE_BASE + main.address);
        assert_eq!(filter.end, EXE_BASE + main.address + main.size);
        assert_eq!(filter.kind, FilterKind::Exclude);
    }

    #[test]
    fn stripped_executable_warns_once_per_missing_symbol() {
        let sh = Path::new("/bin/sh");
        let stripped = ElfImage::load(sh).is_ok_and(|image| !image.has_symtab());
        if !stripped {
            return;
        }
        let map = ProcessMemoryMap::default();
        let mut resolver = AddressResolver::new(&map, sh);
        let name = "crete_stripped_lookup";

        let before = warnings_about(name);
        let filter = resolver
            .resolve_function(name, None, FilterKind::Include)
            .unwrap();
        assert!(filter.is_empty());
        assert_eq!(warnings_about(name) - before, 1);
    }

    #[test]
    fn function_in_unmapped_library_is_fatal() {
        let exe = std::env::current_exe().unwrap();
        let map = map_of(&[PROG]);
        let mut resolver = AddressResolver::new(&map, &exe);
        assert!(matches!(
            resolver.resolve_function("printf", Some("libc.so.6"), FilterKind::Exclude),
            Err(CreteError::LibraryNotFound(_))
        ));
    }

    #[test]
    fn sections_with_zero_address_or_absent_are_skipped() {
        let exe = std::env::current_exe().unwrap();
        let image = ElfImage::load(&exe).unwrap();
        let text = image.section(".text").unwrap();

        let names = vec![".text".to_string(), ".no-such-section".to_string()];
        let filters = resolve_sections(&image, &names, 0x1000, FilterKind::CallStackExclude);
        assert_eq!(
            filters,
            vec![AddressFilter::new(
                0x1000 + text.address,
                0x1000 + text.address + text.size,
                FilterKind::CallStackExclude
            )]
        );

        // Non-allocated sections such as .comment have a zero address.
        if image.section(".comment").is_some() {
            let comment = vec![".comment".to_string()];
            assert!(resolve_sections(&image, &comment, 0, FilterKind::CallStackExclude).is_empty());
        }
    }

    #[test]
    fn mapped_sections_are_rebased_per_image() {
        let (exe, map) = exe_at_base();
        let mut resolver = AddressResolver::new(&map, &exe);

        let image = ElfImage::load(&exe).unwrap();
        let text = image.section(".text").unwrap();
        let bias = if image.is_relocatable() { EXE_BASE } else { 0 };

        let names: BTreeSet<String> = [".text".to_string()].into_iter().collect();
        assert_eq!(
            resolver.resolve_mapped_sections(&names, FilterKind::CallStackExclude),
            vec![AddressFilter::new(
                bias + text.address,
                bias + text.address + text.size,
                FilterKind::CallStackExclude
            )]
        );
    }

    #[test]
    fn mapped_sections_skip_files_that_do_not_exist() {
        let map = map_of(&[PROG, LIBC_B]);
        let mut resolver = AddressResolver::new(&map, Path::new("/opt/target/bin/prog"));
        let names: BTreeSet<String> = [".text".to_string()].into_iter().collect();
        assert!(
            resolver
                .resolve_mapped_sections(&names, FilterKind::CallStackExclude)
                .is_empty()
        );
    }
}
