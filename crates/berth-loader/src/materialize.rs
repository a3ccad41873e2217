//! Default code-unit materializer.

use std::sync::Arc;

use berth_core::{CodeUnit, LoaderId, MaterializeError, Materializer, ResourceOrigin};

/// Materializes WASM modules: validates the byte stream and produces a
/// content-addressed [`CodeUnit`] handle.
#[derive(Debug, Default, Clone, Copy)]
pub struct WasmMaterializer;

impl Materializer for WasmMaterializer {
    fn materialize(
        &self,
        name: &str,
        bytes: &[u8],
        origin: &ResourceOrigin,
        loader: LoaderId,
    ) -> Result<Arc<CodeUnit>, MaterializeError> {
        wasmparser::validate(bytes).map_err(|e| MaterializeError::new(e.to_string()))?;
        let unit = CodeUnit::new(name, loader, origin.clone(), blake3::hash(bytes), bytes.len());
        tracing::trace!(name, digest = %unit.digest().to_hex(), "Materialized code unit");
        Ok(Arc::new(unit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn valid_module_materializes() {
        let bytes = wasm_encoder::Module::new().finish();
        let origin = ResourceOrigin::File(PathBuf::from("/app/classes/app/Main.wasm"));
        let unit = WasmMaterializer
            .materialize("app.Main", &bytes, &origin, LoaderId::next())
            .unwrap();
        assert_eq!(unit.name(), "app.Main");
        assert_eq!(unit.size(), bytes.len());
        assert_eq!(unit.digest(), blake3::hash(&bytes));
    }

    #[test]
    fn garbage_is_rejected() {
        let origin = ResourceOrigin::File(PathBuf::from("/x"));
        let err = WasmMaterializer
            .materialize("app.Bad", b"not a module", &origin, LoaderId::next())
            .unwrap_err();
        assert!(!err.reason.is_empty());
    }
}
