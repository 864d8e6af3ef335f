use minidump::format::{
    CvSignature, MINIDUMP_DIRECTORY, MINIDUMP_LOCATION_DESCRIPTOR, MINIDUMP_MODULE,
    MINIDUMP_STREAM_TYPE, VS_FFI_SIGNATURE, VS_FFI_STRUCVERSION, VS_FIXEDFILEINFO,
};
use minidump::ModuleRecord;

use crate::dump_buf::DumpBuf;

fn version_info(version: Option<[u16; 4]>) -> VS_FIXEDFILEINFO {
    let Some([a, b, c, d]) = version else {
        return VS_FIXEDFILEINFO::default();
    };
    VS_FIXEDFILEINFO {
        signature: VS_FFI_SIGNATURE,
        struct_version: VS_FFI_STRUCVERSION,
        file_version_hi: (u32::from(a) << 16) | u32::from(b),
        file_version_lo: (u32::from(c) << 16) | u32::from(d),
        ..VS_FIXEDFILEINFO::default()
    }
}

/// An ELF CodeView record: the `BpEL` signature and the raw build id.
///
/// Modules with no identifiers at all get no record.
fn write_codeview(
    buf: &mut DumpBuf,
    module: &ModuleRecord,
) -> Result<MINIDUMP_LOCATION_DESCRIPTOR, scroll::Error> {
    if module.debug_file.is_none() && module.code_id.is_none() {
        return Ok(MINIDUMP_LOCATION_DESCRIPTOR::default());
    }
    let mut record = (CvSignature::Elf as u32).to_le_bytes().to_vec();
    record.extend(module.build_id().unwrap_or_default());
    buf.write_all(&record)
}

pub(super) fn write(
    buf: &mut DumpBuf,
    modules: &[ModuleRecord],
) -> Result<MINIDUMP_DIRECTORY, scroll::Error> {
    let mut raw_modules = Vec::with_capacity(modules.len());
    for module in modules {
        buf.align(4);
        let module_name_rva = buf.write_string(&module.name)?.rva;
        let cv_record = write_codeview(buf, module)?;
        raw_modules.push(MINIDUMP_MODULE {
            base_of_image: module.base_address,
            size_of_image: u32::try_from(module.size).unwrap_or(u32::MAX),
            module_name_rva,
            version_info: version_info(module.version),
            cv_record,
            ..MINIDUMP_MODULE::default()
        });
    }
    buf.align(8);
    Ok(MINIDUMP_DIRECTORY {
        stream_type: MINIDUMP_STREAM_TYPE::ModuleListStream.into(),
        location: buf.write_list(&raw_modules)?,
    })
}
