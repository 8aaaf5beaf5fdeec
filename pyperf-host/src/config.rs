//! JSON configuration for a `pyperf-host` run: which processes to sample and
//! the CPython/libc offset tables their interpreters were built with.
//!
//! The wire format is plain serde DTOs rather than `pyperf_common`'s
//! `#[repr(C)]` structs directly — those carry no `Serialize`/`Deserialize`
//! impls (they're shared with the `no_std` eBPF target, where pulling in
//! serde isn't worth it), so this module's job is converting a human-editable
//! JSON document into the fixed-layout rows the maps actually store.

use std::collections::HashMap;
use std::path::Path;

use pyperf_common::{
    InterpreterInfo, LibcImplementation, LibcOffsets, PyCFrameOffsets, PyCodeObjectOffsets,
    PyFrameObjectOffsets, PyInterpreterFrameOffsets, PyObjectOffsets, PyStringOffsets,
    PyThreadStateOffsets, PyTupleObjectOffsets, PyTypeObjectOffsets, PythonVersionOffsets,
};
use serde::{Deserialize, Serialize};

use crate::domain::{Pid, PyperfHostError};
use crate::offsets::builtin_tables;

/// A fully resolved configuration: ready-to-insert map rows, indexed the
/// same way the eBPF maps index them (`py_version_index` /
/// `libc_offset_index` are positions into `python_versions` / the matching
/// libc table).
#[derive(Debug, Clone, Default)]
pub struct PyperfConfig {
    pub pid_to_interpreter_info: HashMap<Pid, InterpreterInfo>,
    pub python_versions: Vec<PythonVersionOffsets>,
    pub glibc_offsets: Vec<LibcOffsets>,
    pub musl_offsets: Vec<LibcOffsets>,
}

impl PyperfConfig {
    /// The configuration this crate runs with when no `--config` file is
    /// given: no processes targeted yet (callers attach a `Pid` at runtime
    /// once discovered), but every built-in offset table loaded so a
    /// process can be added without a restart.
    #[must_use]
    pub fn with_builtin_offsets() -> Self {
        Self {
            pid_to_interpreter_info: HashMap::new(),
            python_versions: builtin_tables::python_versions(),
            glibc_offsets: builtin_tables::glibc_offsets(),
            musl_offsets: builtin_tables::musl_offsets(),
        }
    }

    /// Loads and resolves a JSON config file from disk.
    pub fn load(path: &Path) -> Result<Self, PyperfHostError> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    /// Parses and resolves a JSON config document (split out from [`load`]
    /// so tests can exercise it without touching the filesystem).
    pub fn parse(raw: &str) -> Result<Self, PyperfHostError> {
        let doc: ConfigDoc = serde_json::from_str(raw)
            .map_err(|e| PyperfHostError::ConfigParseFailed(e.to_string()))?;
        doc.resolve()
    }

    /// Registers one target process, validating that its offset indices are
    /// in range for the loaded tables.
    pub fn add_process(
        &mut self,
        pid: Pid,
        info: InterpreterInfo,
    ) -> Result<(), PyperfHostError> {
        if info.py_version_index as usize >= self.python_versions.len() {
            return Err(PyperfHostError::ConfigParseFailed(format!(
                "py_version_index {} out of range for {} known Python versions",
                info.py_version_index,
                self.python_versions.len()
            )));
        }
        let libc_table_len = match info.libc_implementation() {
            LibcImplementation::Glibc => self.glibc_offsets.len(),
            LibcImplementation::Musl => self.musl_offsets.len(),
            LibcImplementation::Unknown => 0,
        };
        if info.libc_implementation() != LibcImplementation::Unknown
            && info.libc_offset_index as usize >= libc_table_len
        {
            return Err(PyperfHostError::ConfigParseFailed(format!(
                "libc_offset_index {} out of range for {} known rows",
                info.libc_offset_index, libc_table_len
            )));
        }
        self.pid_to_interpreter_info.insert(pid, info);
        Ok(())
    }
}

/// Raw JSON shape. Kept separate from [`PyperfConfig`] so malformed input
/// fails at the deserialization boundary rather than surfacing as an
/// out-of-range index deep inside the loader.
#[derive(Debug, Serialize, Deserialize, Default)]
struct ConfigDoc {
    #[serde(default)]
    processes: Vec<ProcessEntry>,
    #[serde(default)]
    python_versions: Vec<PythonVersionOffsetsDto>,
    #[serde(default)]
    glibc_offsets: Vec<LibcOffsetsDto>,
    #[serde(default)]
    musl_offsets: Vec<LibcOffsetsDto>,
}

impl ConfigDoc {
    fn resolve(self) -> Result<PyperfConfig, PyperfHostError> {
        let python_versions = if self.python_versions.is_empty() {
            builtin_tables::python_versions()
        } else {
            self.python_versions.into_iter().map(Into::into).collect()
        };
        let glibc_offsets = if self.glibc_offsets.is_empty() {
            builtin_tables::glibc_offsets()
        } else {
            self.glibc_offsets.into_iter().map(Into::into).collect()
        };
        let musl_offsets = if self.musl_offsets.is_empty() {
            builtin_tables::musl_offsets()
        } else {
            self.musl_offsets.into_iter().map(Into::into).collect()
        };

        let mut config = PyperfConfig {
            pid_to_interpreter_info: HashMap::new(),
            python_versions,
            glibc_offsets,
            musl_offsets,
        };
        for process in self.processes {
            let pid = Pid(process.pid);
            let info = process.into_interpreter_info();
            config.add_process(pid, info)?;
        }
        Ok(config)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ProcessEntry {
    pid: u32,
    #[serde(default)]
    thread_state_addr: u64,
    #[serde(default)]
    use_tls: bool,
    #[serde(default)]
    tls_key: i32,
    py_version_index: u32,
    #[serde(default)]
    libc: LibcChoice,
    #[serde(default)]
    libc_offset_index: u32,
}

impl ProcessEntry {
    fn into_interpreter_info(self) -> InterpreterInfo {
        InterpreterInfo {
            thread_state_addr: self.thread_state_addr,
            use_tls: u8::from(self.use_tls),
            _pad0: [0; 3],
            tls_key: self.tls_key,
            py_version_index: self.py_version_index,
            libc_implementation: self.libc as u8,
            _pad1: [0; 3],
            libc_offset_index: self.libc_offset_index,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
enum LibcChoice {
    #[default]
    Unknown = 0,
    Glibc = 1,
    Musl = 2,
}

#[derive(Debug, Serialize, Deserialize)]
struct PythonVersionOffsetsDto {
    #[serde(default)]
    frame: i64,
    #[serde(default = "default_none_offset")]
    cframe: i64,
    #[serde(default = "default_none_offset")]
    current_frame: i64,
    #[serde(default)]
    f_code: i64,
    #[serde(default)]
    f_back: i64,
    #[serde(default)]
    f_localsplus: i64,
    #[serde(default = "default_none_offset")]
    owner: i64,
    #[serde(default)]
    co_varnames: i64,
    #[serde(default)]
    co_filename: i64,
    #[serde(default)]
    co_name: i64,
    #[serde(default)]
    co_firstlineno: i64,
    #[serde(default)]
    ob_item: i64,
    #[serde(default)]
    ob_type: i64,
    #[serde(default)]
    tp_name: i64,
    #[serde(default)]
    string_data: i64,
    #[serde(default)]
    thread_id: i64,
}

/// Most offset fields default to `0` (a harmless placeholder if the caller
/// forgets them, since callers are expected to supply every field for a
/// version they actually intend to sample), but `-1`-sentinel fields need
/// their own default so an omitted field reads as "not present on this
/// version" rather than "at byte 0".
fn default_none_offset() -> i64 {
    -1
}

impl From<PythonVersionOffsetsDto> for PythonVersionOffsets {
    fn from(dto: PythonVersionOffsetsDto) -> Self {
        PythonVersionOffsets {
            py_thread_state: PyThreadStateOffsets {
                frame: dto.frame,
                cframe: dto.cframe,
                thread_id: dto.thread_id,
            },
            py_cframe: PyCFrameOffsets { current_frame: dto.current_frame },
            py_frame_object: PyFrameObjectOffsets {
                f_code: dto.f_code,
                f_back: dto.f_back,
                f_localsplus: dto.f_localsplus,
            },
            py_interpreter_frame: PyInterpreterFrameOffsets { owner: dto.owner },
            py_code_object: PyCodeObjectOffsets {
                co_varnames: dto.co_varnames,
                co_filename: dto.co_filename,
                co_name: dto.co_name,
                co_firstlineno: dto.co_firstlineno,
            },
            py_tuple_object: PyTupleObjectOffsets { ob_item: dto.ob_item },
            py_object: PyObjectOffsets { ob_type: dto.ob_type },
            py_type_object: PyTypeObjectOffsets { tp_name: dto.tp_name },
            py_string: PyStringOffsets { data: dto.string_data },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LibcOffsetsDto {
    pthread_size: u64,
    pthread_block: u64,
    pthread_key_data: u64,
    pthread_key_data_size: u64,
}

impl From<LibcOffsetsDto> for LibcOffsets {
    fn from(dto: LibcOffsetsDto) -> Self {
        LibcOffsets {
            pthread_size: dto.pthread_size,
            pthread_block: dto.pthread_block,
            pthread_key_data: dto.pthread_key_data,
            pthread_key_data_size: dto.pthread_key_data_size,
        }
    }
}
