//! Best-effort frame symbolization (reference §4.4).
//!
//! Resolves a `PyCodeObject` into a filename, function name and line
//! number, then applies the cheap "first positional argument looks like
//! `self`/`cls`" heuristic to recover a qualified class name when the frame
//! belongs to a bound method. Every read here is best-effort: a failed
//! probe read leaves its destination field at whatever `Symbol::empty()`
//! started it at rather than aborting symbolization, exactly like the
//! reference's `read_symbol`, which never checks the return code of any of
//! its constituent reads. The class-name heuristic itself compares only
//! the first four bytes of the argument name as a `u32`, so it's wrong
//! (rather than merely slow) for shadowed names sharing that prefix —
//! that's an accepted trade, not a bug.

use pyperf_common::{PythonVersionOffsets, Symbol};

use crate::probe::Probe;

/// `b"self"` read as a little-endian `u32`.
const SELF_PREFIX: u32 = u32::from_le_bytes(*b"self");
/// `b"cls\0"` read as a little-endian `u32` — `cls` is 3 bytes, so the
/// fourth is the NUL terminator of the (short, interned) identifier.
const CLS_PREFIX: u32 = u32::from_le_bytes(*b"cls\0");

/// Reads a Python string object's backing bytes (assumed ASCII/Latin-1,
/// which holds for the identifiers and filenames this core ever looks at)
/// into `out`. A no-op on fault, leaving `out` untouched.
fn read_py_string<P: Probe>(probe: &P, offsets: &PythonVersionOffsets, str_obj_addr: u64, out: &mut [u8]) {
    if str_obj_addr == 0 {
        return;
    }
    if let Some(data_addr) = str_obj_addr.checked_add(offsets.py_string.data as u64) {
        let _ = probe.read_str_bytes(data_addr, out);
    }
}

/// Applies the self/cls heuristic and, if it fires, fills in
/// `symbol.class_name`. A no-op on any failed read along the way.
fn resolve_class_name<P: Probe>(
    probe: &P,
    offsets: &PythonVersionOffsets,
    code_addr: u64,
    frame_localsplus_addr: u64,
    symbol: &mut Symbol,
) {
    let Some(varnames) = probe.read_u64(code_addr + offsets.py_code_object.co_varnames as u64)
    else {
        return;
    };
    let Some(first_arg_name_obj) =
        probe.read_u64(varnames + offsets.py_tuple_object.ob_item as u64)
    else {
        return;
    };

    let mut prefix = [0u8; 4];
    read_py_string(probe, offsets, first_arg_name_obj, &mut prefix);
    let prefix_word = u32::from_le_bytes(prefix);
    let is_self = prefix_word == SELF_PREFIX;
    let is_cls = prefix_word == CLS_PREFIX;
    if !is_self && !is_cls {
        return;
    }

    let Some(mut ptr) = probe.read_u64(frame_localsplus_addr) else {
        return;
    };
    if is_self {
        let Some(type_obj) = probe.read_u64(ptr + offsets.py_object.ob_type as u64) else {
            return;
        };
        ptr = type_obj;
    }
    let Some(tp_name_addr) = probe.read_u64(ptr + offsets.py_type_object.tp_name as u64) else {
        return;
    };
    // tp_name is a plain C string, not a PyObject, so it's read directly
    // rather than through `read_py_string`.
    let _ = probe.read_str_bytes(tp_name_addr, &mut symbol.class_name);
}

/// Resolves one frame's symbol (filename, function name, qualified class
/// name) and line number. Never fails: every constituent read is best
/// effort, matching the reference's `read_symbol`. The caller is
/// responsible for having already confirmed `code_addr` is non-null and
/// readable (the one check the reference performs before calling in).
pub fn resolve_frame_symbol<P: Probe>(
    probe: &P,
    offsets: &PythonVersionOffsets,
    code_addr: u64,
    frame_localsplus_addr: u64,
) -> (Symbol, u32) {
    let mut symbol = Symbol::empty();

    resolve_class_name(probe, offsets, code_addr, frame_localsplus_addr, &mut symbol);

    if let Some(filename_obj) = probe.read_u64(code_addr + offsets.py_code_object.co_filename as u64) {
        read_py_string(probe, offsets, filename_obj, &mut symbol.path);
    }

    if let Some(name_obj) = probe.read_u64(code_addr + offsets.py_code_object.co_name as u64) {
        read_py_string(probe, offsets, name_obj, &mut symbol.method_name);
    }

    let lineno = probe
        .read_u32(code_addr + offsets.py_code_object.co_firstlineno as u64)
        .unwrap_or(0);

    (symbol, lineno)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeProcessImage;
    use pyperf_common::{
        PyCodeObjectOffsets, PyObjectOffsets, PyStringOffsets, PyTupleObjectOffsets,
        PyTypeObjectOffsets,
    };

    fn offsets() -> PythonVersionOffsets {
        PythonVersionOffsets {
            py_code_object: PyCodeObjectOffsets {
                co_varnames: 8,
                co_filename: 16,
                co_name: 24,
                co_firstlineno: 32,
            },
            py_tuple_object: PyTupleObjectOffsets { ob_item: 24 },
            py_object: PyObjectOffsets { ob_type: 8 },
            py_type_object: PyTypeObjectOffsets { tp_name: 40 },
            py_string: PyStringOffsets { data: 48 },
            ..Default::default()
        }
    }

    fn write_str(image: &mut FakeProcessImage, obj_addr: u64, data_offset: i64, text: &str) {
        let data_addr = obj_addr + data_offset as u64;
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        image.write_bytes(data_addr, &bytes);
    }

    #[test]
    fn resolves_filename_name_and_lineno_without_self() {
        let offsets = offsets();
        let mut image = FakeProcessImage::new();
        let code_addr = 0x1000u64;
        let filename_obj = 0x2000u64;
        let name_obj = 0x3000u64;

        image.write_u64(code_addr + offsets.py_code_object.co_filename as u64, filename_obj);
        image.write_u64(code_addr + offsets.py_code_object.co_name as u64, name_obj);
        image.write_i32(code_addr + offsets.py_code_object.co_firstlineno as u64, 42);
        write_str(&mut image, filename_obj, offsets.py_string.data, "app.py");
        write_str(&mut image, name_obj, offsets.py_string.data, "handler");
        // No co_varnames pointer written: class-name heuristic should
        // fail closed, not panic.

        let (symbol, lineno) = resolve_frame_symbol(&image, &offsets, code_addr, 0x9999);
        assert_eq!(lineno, 42);
        assert_eq!(symbol.method_name_as_str(), "handler");
        assert_eq!(symbol.path_as_str(), "app.py");
        assert_eq!(symbol.class_name_as_str(), "");
    }

    #[test]
    fn resolves_class_name_when_first_arg_is_self() {
        let offsets = offsets();
        let mut image = FakeProcessImage::new();
        let code_addr = 0x1000u64;
        let filename_obj = 0x2000u64;
        let name_obj = 0x3000u64;
        let varnames_tuple = 0x4000u64;
        let arg0_name_obj = 0x4100u64;
        let self_obj = 0x5000u64;
        let type_obj = 0x6000u64;
        let tp_name_addr = 0x7000u64;
        let frame_localsplus = 0x8000u64;

        image.write_u64(code_addr + offsets.py_code_object.co_filename as u64, filename_obj);
        image.write_u64(code_addr + offsets.py_code_object.co_name as u64, name_obj);
        image.write_i32(code_addr + offsets.py_code_object.co_firstlineno as u64, 7);
        write_str(&mut image, filename_obj, offsets.py_string.data, "models.py");
        write_str(&mut image, name_obj, offsets.py_string.data, "save");

        image.write_u64(code_addr + offsets.py_code_object.co_varnames as u64, varnames_tuple);
        image.write_u64(varnames_tuple + offsets.py_tuple_object.ob_item as u64, arg0_name_obj);
        write_str(&mut image, arg0_name_obj, offsets.py_string.data, "self");

        image.write_u64(frame_localsplus, self_obj);
        image.write_u64(self_obj + offsets.py_object.ob_type as u64, type_obj);
        image.write_u64(type_obj + offsets.py_type_object.tp_name as u64, tp_name_addr);
        image.write_bytes(tp_name_addr, b"Model\0");

        let (symbol, _) = resolve_frame_symbol(&image, &offsets, code_addr, frame_localsplus);
        assert_eq!(symbol.class_name_as_str(), "Model");
    }

    #[test]
    fn resolves_class_name_when_first_arg_is_cls() {
        let offsets = offsets();
        let mut image = FakeProcessImage::new();
        let code_addr = 0x1000u64;
        let varnames_tuple = 0x4000u64;
        let arg0_name_obj = 0x4100u64;
        let cls_obj = 0x5000u64;
        let tp_name_addr = 0x7000u64;
        let frame_localsplus = 0x8000u64;

        image.write_u64(code_addr + offsets.py_code_object.co_varnames as u64, varnames_tuple);
        image.write_u64(varnames_tuple + offsets.py_tuple_object.ob_item as u64, arg0_name_obj);
        write_str(&mut image, arg0_name_obj, offsets.py_string.data, "cls");

        // For `cls`, the first local *is* the type object already: no
        // ob_type indirection.
        image.write_u64(frame_localsplus, cls_obj);
        image.write_u64(cls_obj + offsets.py_type_object.tp_name as u64, tp_name_addr);
        image.write_bytes(tp_name_addr, b"Model\0");

        let (symbol, _) = resolve_frame_symbol(&image, &offsets, code_addr, frame_localsplus);
        assert_eq!(symbol.class_name_as_str(), "Model");
    }

    #[test]
    fn missing_reads_leave_an_empty_best_effort_symbol_instead_of_failing() {
        let offsets = offsets();
        let image = FakeProcessImage::new();
        let (symbol, lineno) = resolve_frame_symbol(&image, &offsets, 0x1000, 0x8000);
        assert_eq!(lineno, 0);
        assert_eq!(symbol.path_as_str(), "");
        assert_eq!(symbol.method_name_as_str(), "");
        assert_eq!(symbol.class_name_as_str(), "");
    }
}
