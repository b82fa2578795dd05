/// Test Assembly Manifest Reflection
///
/// **Core Responsibility:**
/// Turn a test assembly manifest (a JSON capability descriptor listing
/// classes, methods and their attributes) into [`ClassTestPlan`]s plus
/// diagnostics.
///
/// **Rules:**
/// - Only classes carrying `TestClass` are considered
/// - `DataRow` implies a test method; each row becomes its own test case
/// - Class-level `Trait` and `DeviceSelection` are defaults for its methods
/// - Unknown attribute kinds are warnings and are otherwise ignored
/// - Every problem is a [`Diagnostic`]; reflection never stops early
use nanotest_common::predicate::{PredicateRegistry, SelectionPredicate};
use nanotest_common::protocol::AssemblyDiscovery;
use nanotest_common::types::{
    ClassTestPlan, Diagnostic, Instancing, MethodRef, TestCase, TestCaseId, TestCollection,
    TraitFilter,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use tracing::{debug, instrument};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AssemblyManifest {
    /// Defaults to the manifest file stem
    #[serde(default)]
    pub assembly: Option<String>,
    /// Raw [`ClassDescriptor`]s; a malformed entry costs only that class
    #[serde(default)]
    pub classes: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassDescriptor {
    pub name: String,
    /// Raw attributes; decoded one by one so an unknown kind only costs a warning
    #[serde(default)]
    pub attributes: Vec<Value>,
    /// Raw [`MethodDescriptor`]s; a malformed entry costs only that method
    #[serde(default)]
    pub methods: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub name: String,
    /// Parameter type names, in order
    #[serde(default)]
    pub parameters: Vec<String>,
    #[serde(default)]
    pub attributes: Vec<Value>,
}

/// `name` of a raw descriptor, if it has a usable one
fn raw_name(raw: &Value) -> Option<&str> {
    raw.get("name").and_then(Value::as_str)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Attribute {
    TestClass,
    SharedInstance,
    InstancePerMethod,
    TestMethod,
    Setup,
    Cleanup,
    DataRow {
        #[serde(default)]
        args: Vec<Value>,
    },
    Trait {
        name: String,
    },
    Description {
        text: String,
    },
    DeviceSelection {
        predicate: SelectionPredicate,
    },
}

impl Attribute {
    fn is_class_level(&self) -> bool {
        matches!(
            self,
            Attribute::TestClass | Attribute::SharedInstance | Attribute::InstancePerMethod
        )
    }

    fn kind(&self) -> &'static str {
        match self {
            Attribute::TestClass => "TestClass",
            Attribute::SharedInstance => "SharedInstance",
            Attribute::InstancePerMethod => "InstancePerMethod",
            Attribute::TestMethod => "TestMethod",
            Attribute::Setup => "Setup",
            Attribute::Cleanup => "Cleanup",
            Attribute::DataRow { .. } => "DataRow",
            Attribute::Trait { .. } => "Trait",
            Attribute::Description { .. } => "Description",
            Attribute::DeviceSelection { .. } => "DeviceSelection",
        }
    }
}

/// Read and reflect one manifest file. Unreadable or malformed files yield
/// an empty collection and an error diagnostic.
#[instrument(skip_all, fields(path = %path.display()))]
pub async fn reflect_file(
    path: &Path,
    registry: &PredicateRegistry,
    filter: &TraitFilter,
) -> AssemblyDiscovery {
    let fallback = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    let content = match tokio::fs::read(path).await {
        Ok(content) => content,
        Err(e) => return unreadable(fallback, format!("cannot read {}: {}", path.display(), e)),
    };
    let manifest: AssemblyManifest = match serde_json::from_slice(&content) {
        Ok(manifest) => manifest,
        Err(e) => return unreadable(fallback, format!("malformed manifest {}: {}", path.display(), e)),
    };

    reflect(&fallback, manifest, registry, filter)
}

fn unreadable(assembly: String, message: String) -> AssemblyDiscovery {
    AssemblyDiscovery {
        diagnostics: vec![Diagnostic::error(assembly.clone(), None, message)],
        assembly,
        collection: TestCollection::new(),
    }
}

pub fn reflect(
    fallback_name: &str,
    manifest: AssemblyManifest,
    registry: &PredicateRegistry,
    filter: &TraitFilter,
) -> AssemblyDiscovery {
    let assembly = manifest.assembly.unwrap_or_else(|| fallback_name.to_string());
    let mut reflector = Reflector {
        assembly: &assembly,
        registry,
        diagnostics: Vec::new(),
    };

    let mut seen = HashSet::new();
    let mut collection = TestCollection::new();
    for (index, raw) in manifest.classes.into_iter().enumerate() {
        let class: ClassDescriptor = match ClassDescriptor::deserialize(&raw) {
            Ok(class) => class,
            Err(e) => {
                let location = raw_name(&raw)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("classes[{}]", index));
                reflector.error(Some(location), format!("malformed class: {}; class skipped", e));
                continue;
            }
        };
        if !seen.insert(class.name.clone()) {
            reflector.error(Some(class.name.clone()), "duplicate class name; later declaration skipped");
            continue;
        }
        if let Some(plan) = reflector.class_plan(&class) {
            if !plan.tests.is_empty() {
                collection.classes.push(plan);
            }
        }
    }

    let collection = collection.filtered(filter);
    debug!(
        assembly = %assembly,
        classes = collection.classes.len(),
        tests = collection.test_count(),
        diagnostics = reflector.diagnostics.len(),
        "assembly reflected"
    );
    AssemblyDiscovery {
        diagnostics: reflector.diagnostics,
        assembly,
        collection,
    }
}

struct Reflector<'a> {
    assembly: &'a str,
    registry: &'a PredicateRegistry,
    diagnostics: Vec<Diagnostic>,
}

/// Attributes of one class or method, sorted by role
#[derive(Default)]
struct Decoded {
    test_class: bool,
    shared: bool,
    per_method: bool,
    test_method: bool,
    setup: bool,
    cleanup: bool,
    rows: Vec<Vec<Value>>,
    traits: BTreeSet<String>,
    description: Option<String>,
    predicate: Option<SelectionPredicate>,
}

impl<'a> Reflector<'a> {
    fn error(&mut self, location: Option<String>, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::error(self.assembly, location, message));
    }

    fn warning(&mut self, location: Option<String>, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::warning(self.assembly, location, message));
    }

    fn decode(&mut self, location: &str, raw: &[Value], on_class: bool) -> Decoded {
        let mut decoded = Decoded::default();

        for value in raw {
            let attribute: Attribute = match serde_json::from_value(value.clone()) {
                Ok(attribute) => attribute,
                Err(e) => {
                    self.warning(Some(location.to_string()), format!("ignored attribute {}: {}", value, e));
                    continue;
                }
            };

            let misplaced = match &attribute {
                Attribute::Trait { .. } | Attribute::DeviceSelection { .. } => false,
                other if on_class => !other.is_class_level(),
                other => other.is_class_level(),
            };
            if misplaced {
                let target = if on_class { "class" } else { "method" };
                self.warning(
                    Some(location.to_string()),
                    format!("{} is not valid on a {}; ignored", attribute.kind(), target),
                );
                continue;
            }

            match attribute {
                Attribute::TestClass => decoded.test_class = true,
                Attribute::SharedInstance => decoded.shared = true,
                Attribute::InstancePerMethod => decoded.per_method = true,
                Attribute::TestMethod => decoded.test_method = true,
                Attribute::Setup => decoded.setup = true,
                Attribute::Cleanup => decoded.cleanup = true,
                Attribute::DataRow { args } => decoded.rows.push(args),
                Attribute::Trait { name } => {
                    decoded.traits.insert(name);
                }
                Attribute::Description { text } => decoded.description = Some(text),
                Attribute::DeviceSelection { predicate } => {
                    if decoded.predicate.is_some() {
                        self.warning(
                            Some(location.to_string()),
                            format!("more than one DeviceSelection; '{}' ignored", predicate),
                        );
                    } else {
                        decoded.predicate = Some(predicate);
                    }
                }
            }
        }

        if let Some(predicate) = &decoded.predicate {
            if !self.registry.can_resolve(predicate) {
                self.warning(
                    Some(location.to_string()),
                    format!("device predicate '{}' is not registered; tests will report a predicate error", predicate),
                );
            }
        }
        decoded
    }

    fn class_plan(&mut self, class: &ClassDescriptor) -> Option<ClassTestPlan> {
        let attrs = self.decode(&class.name, &class.attributes, true);

        if !attrs.test_class {
            if !class.methods.is_empty() {
                debug!(class = %class.name, "no TestClass attribute; skipped");
            }
            return None;
        }
        if attrs.shared && attrs.per_method {
            self.error(
                Some(class.name.clone()),
                "class declares both SharedInstance and InstancePerMethod; class skipped",
            );
            return None;
        }
        let instancing = if attrs.shared {
            Instancing::Shared
        } else {
            Instancing::PerMethod
        };

        let mut plan = ClassTestPlan {
            assembly: self.assembly.to_string(),
            class: class.name.clone(),
            setup: Vec::new(),
            cleanup: Vec::new(),
            instancing,
            tests: Vec::new(),
        };

        for (index, raw) in class.methods.iter().enumerate() {
            let method: MethodDescriptor = match MethodDescriptor::deserialize(raw) {
                Ok(method) => method,
                Err(e) => {
                    let location = match raw_name(raw) {
                        Some(name) => format!("{}.{}", class.name, name),
                        None => format!("{}.methods[{}]", class.name, index),
                    };
                    self.error(Some(location), format!("malformed method: {}; method skipped", e));
                    continue;
                }
            };
            let location = format!("{}.{}", class.name, method.name);
            let mattrs = self.decode(&location, &method.attributes, false);
            let is_test = mattrs.test_method || !mattrs.rows.is_empty();

            if mattrs.setup && mattrs.cleanup {
                self.error(Some(location), "method is marked both Setup and Cleanup; skipped");
                continue;
            }
            if is_test && (mattrs.setup || mattrs.cleanup) {
                self.error(Some(location), "method is marked both as a test and as Setup/Cleanup; skipped");
                continue;
            }

            let method_ref = MethodRef {
                assembly: self.assembly.to_string(),
                class: class.name.clone(),
                method: method.name.clone(),
            };

            if mattrs.setup || mattrs.cleanup {
                if !method.parameters.is_empty() {
                    self.error(Some(location), "Setup/Cleanup methods cannot take parameters; skipped");
                } else if mattrs.setup {
                    plan.setup.push(method_ref);
                } else {
                    plan.cleanup.push(method_ref);
                }
                continue;
            }

            if is_test {
                let tests = self.expand(&location, class, &method, &attrs, mattrs);
                plan.tests.extend(tests);
            }
        }

        Some(plan)
    }

    /// One test case per valid data row, or a single argument-less case
    fn expand(
        &mut self,
        location: &str,
        class: &ClassDescriptor,
        method: &MethodDescriptor,
        class_attrs: &Decoded,
        attrs: Decoded,
    ) -> Vec<TestCase> {
        let predicate = attrs
            .predicate
            .or_else(|| class_attrs.predicate.clone())
            .unwrap_or_default();
        let mut traits = class_attrs.traits.clone();
        traits.extend(attrs.traits);
        let description = attrs
            .description
            .unwrap_or_else(|| format!("{}.{}", class.name, method.name));

        let assembly = self.assembly;
        let make = |row: Option<u32>, args: Vec<Value>| {
            let description = if args.is_empty() {
                description.clone()
            } else {
                let rendered: Vec<String> = args.iter().map(Value::to_string).collect();
                format!("{}({})", description, rendered.join(", "))
            };
            TestCase {
                id: TestCaseId::new(class.name.clone(), method.name.clone(), row),
                assembly: assembly.to_string(),
                args,
                predicate: predicate.clone(),
                description,
                traits: traits.clone(),
            }
        };

        if attrs.rows.is_empty() {
            if !method.parameters.is_empty() {
                self.error(
                    Some(location.to_string()),
                    format!(
                        "test method takes {} parameter(s) but has no DataRow; skipped",
                        method.parameters.len()
                    ),
                );
                return Vec::new();
            }
            return vec![make(None, Vec::new())];
        }

        let mut tests = Vec::new();
        let mut mismatched = Vec::new();
        for (index, args) in attrs.rows.into_iter().enumerate() {
            if args.len() != method.parameters.len() {
                mismatched.push((index, args.len()));
                continue;
            }
            tests.push(make(Some(index as u32), args));
        }
        for (index, count) in mismatched {
            self.error(
                Some(location.to_string()),
                format!(
                    "DataRow {} has {} argument(s) but the method takes {}; row skipped",
                    index,
                    count,
                    method.parameters.len()
                ),
            );
        }
        tests
    }
}
