use std::{env, fs, path::PathBuf};
use syn::parse_str;
use toml_edit::{DocumentMut, Item};

const FACADES: [&str; 2] = ["parallax", "parallax_internal"];

/// A dependency of the crate being compiled: the key it is declared under and
/// the name it is imported as.
struct Dependency {
    key: String,
    import: String,
}

/// Resolves how generated code should name a `parallax_*` crate from the crate
/// currently being compiled.
///
/// Lookup order: the crate itself (`crate`), a direct dependency (respecting
/// `package = ...` renames), then a facade (`parallax::graph`,
/// `parallax_internal::graph`).
pub struct ParallaxManifest {
    package: String,
    dependencies: Vec<Dependency>,
}

impl Default for ParallaxManifest {
    fn default() -> Self {
        let dir = env::var_os("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR is not defined.");
        let path = PathBuf::from(dir).join("Cargo.toml");
        let text = fs::read_to_string(&path)
            .unwrap_or_else(|_| panic!("Unable to read cargo manifest: {}", path.display()));
        let manifest = text
            .parse::<DocumentMut>()
            .unwrap_or_else(|_| panic!("Failed to parse cargo manifest: {}", path.display()));
        let package = env::var("CARGO_PKG_NAME").expect("CARGO_PKG_NAME is not defined.");
        Self::from_manifest(&manifest, package)
    }
}

impl ParallaxManifest {
    fn from_manifest(manifest: &DocumentMut, package: String) -> Self {
        let mut dependencies = Vec::new();
        for table in ["dependencies", "dev-dependencies"] {
            let Some(deps) = manifest.get(table).and_then(Item::as_table_like) else {
                continue;
            };
            for (key, item) in deps.iter() {
                // `alias = { package = "parallax_graph" }` imports as `alias`
                let package = item.get("package").and_then(|p| p.as_str()).unwrap_or(key);
                dependencies.push(Dependency {
                    key: package.replace('-', "_"),
                    import: key.replace('-', "_"),
                });
            }
        }
        Self {
            package: package.replace('-', "_"),
            dependencies,
        }
    }

    fn import_of(&self, name: &str) -> Option<&str> {
        self.dependencies
            .iter()
            .find(|d| d.key == name)
            .map(|d| d.import.as_str())
    }

    pub fn maybe_get_path(&self, name: &str) -> Option<syn::Path> {
        if name == self.package {
            return Some(Self::parse_str("crate"));
        }
        if let Some(import) = self.import_of(name) {
            return Some(Self::parse_str(import));
        }
        let module = name.strip_prefix("parallax_")?;
        FACADES
            .iter()
            .find_map(|facade| self.import_of(facade))
            .map(|facade| Self::parse_str(&format!("{}::{}", facade, module)))
    }

    pub fn get_path(&self, name: &str) -> syn::Path {
        let name = name.replace('-', "_");
        self.maybe_get_path(&name).unwrap_or_else(|| Self::parse_str(&name))
    }

    pub fn parse_str<T: syn::parse::Parse>(path: &str) -> T {
        parse_str(path).unwrap_or_else(|_| panic!("invalid path: {}", path))
    }
}
