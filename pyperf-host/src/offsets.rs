//! Built-in offset tables, used when a run has no `--config` file.
//!
//! These are illustrative defaults for mainstream CPython 3.9 and 3.11
//! builds on glibc and musl — real deployments with a custom-built
//! interpreter should still supply their own `version_specific_offsets` /
//! `glibc_offsets` / `musl_offsets` via config, since offsets drift across
//! point releases and distro patches. Table order is significant: a row's
//! position is the `py_version_index` / `libc_offset_index` that
//! `InterpreterInfo` refers to.

pub mod builtin_tables {
    use pyperf_common::{
        LibcOffsets, PyCFrameOffsets, PyCodeObjectOffsets, PyFrameObjectOffsets,
        PyInterpreterFrameOffsets, PyObjectOffsets, PyStringOffsets, PyThreadStateOffsets,
        PyTupleObjectOffsets, PyTypeObjectOffsets, PythonVersionOffsets,
    };

    /// Index 0: CPython 3.9. Index 1: CPython 3.11.
    #[must_use]
    pub fn python_versions() -> Vec<PythonVersionOffsets> {
        vec![python_3_9(), python_3_11()]
    }

    fn python_3_9() -> PythonVersionOffsets {
        PythonVersionOffsets {
            py_thread_state: PyThreadStateOffsets { frame: 48, cframe: -1, thread_id: 176 },
            py_cframe: PyCFrameOffsets { current_frame: -1 },
            py_frame_object: PyFrameObjectOffsets {
                f_code: 32,
                f_back: 24,
                f_localsplus: 360,
            },
            py_interpreter_frame: PyInterpreterFrameOffsets { owner: -1 },
            py_code_object: PyCodeObjectOffsets {
                co_varnames: 88,
                co_filename: 96,
                co_name: 104,
                co_firstlineno: 68,
            },
            py_tuple_object: PyTupleObjectOffsets { ob_item: 24 },
            py_object: PyObjectOffsets { ob_type: 8 },
            py_type_object: PyTypeObjectOffsets { tp_name: 24 },
            py_string: PyStringOffsets { data: 48 },
        }
    }

    fn python_3_11() -> PythonVersionOffsets {
        PythonVersionOffsets {
            py_thread_state: PyThreadStateOffsets { frame: -1, cframe: 56, thread_id: 184 },
            py_cframe: PyCFrameOffsets { current_frame: 0 },
            py_frame_object: PyFrameObjectOffsets {
                f_code: 32,
                f_back: 0,
                f_localsplus: 72,
            },
            py_interpreter_frame: PyInterpreterFrameOffsets { owner: 69 },
            py_code_object: PyCodeObjectOffsets {
                co_varnames: 112,
                co_filename: 120,
                co_name: 128,
                co_firstlineno: 44,
            },
            py_tuple_object: PyTupleObjectOffsets { ob_item: 24 },
            py_object: PyObjectOffsets { ob_type: 8 },
            py_type_object: PyTypeObjectOffsets { tp_name: 24 },
            py_string: PyStringOffsets { data: 48 },
        }
    }

    /// Index 0: glibc x86-64. Index 1: glibc aarch64.
    #[must_use]
    pub fn glibc_offsets() -> Vec<LibcOffsets> {
        vec![
            LibcOffsets {
                pthread_size: 2304,
                pthread_block: 1296,
                pthread_key_data: 1312,
                pthread_key_data_size: 16,
            },
            LibcOffsets {
                pthread_size: 1776,
                pthread_block: 1024,
                pthread_key_data: 1040,
                pthread_key_data_size: 16,
            },
        ]
    }

    /// Index 0: musl x86-64. Index 1: musl aarch64.
    #[must_use]
    pub fn musl_offsets() -> Vec<LibcOffsets> {
        vec![
            LibcOffsets {
                pthread_size: 1776,
                pthread_block: 0,
                pthread_key_data: 0,
                pthread_key_data_size: 0,
            },
            LibcOffsets {
                pthread_size: 1776,
                pthread_block: 0,
                pthread_key_data: 0,
                pthread_key_data_size: 0,
            },
        ]
    }
}
