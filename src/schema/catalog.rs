//! The set of installed models and the tenant accessors derived from them.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard};

use tracing::debug;

use super::declaration::{Declaration, ModelKey, SharedModel};
use super::field::ColumnType;
use crate::descriptor::TenantDescriptor;
use crate::error::ConfigurationError;
use crate::naming::is_valid_segment;

/// A reference resolved against the catalog.
#[derive(Debug, Clone, Copy)]
pub enum Resolved<'a> {
    Tenant(&'a Declaration),
    Shared(&'a SharedModel),
}

impl Resolved<'_> {
    pub fn key(&self) -> &ModelKey {
        match self {
            Resolved::Tenant(declaration) => declaration.key(),
            Resolved::Shared(model) => model.key(),
        }
    }

    pub fn label(&self) -> String {
        match self {
            Resolved::Tenant(declaration) => declaration.label(),
            Resolved::Shared(model) => model.label(),
        }
    }
}

/// Snapshot view of the installed models.
#[derive(Debug, Default)]
pub struct CatalogState {
    declarations: BTreeMap<ModelKey, Declaration>,
    shared: BTreeMap<ModelKey, SharedModel>,
    descriptors: BTreeMap<String, ModelKey>,
}

impl CatalogState {
    pub fn declaration(&self, key: &ModelKey) -> Option<&Declaration> {
        self.declarations.get(key)
    }

    pub fn shared(&self, key: &ModelKey) -> Option<&SharedModel> {
        self.shared.get(key)
    }

    /// Resolves `"self"`, a bare `"Model"` in the owner's app, or a dotted `"app.Model"`.
    pub fn resolve(&self, reference: &str, owner: &ModelKey) -> Option<Resolved<'_>> {
        let key = if reference == "self" {
            owner.clone()
        } else if reference.contains('.') {
            ModelKey::parse(reference)?
        } else {
            ModelKey::new(owner.app_label(), reference)
        };

        if let Some(declaration) = self.declarations.get(&key) {
            return Some(Resolved::Tenant(declaration));
        }
        self.shared.get(&key).map(Resolved::Shared)
    }

    /// True for installed tenant models (abstract mixins excluded).
    pub fn is_tenant_model(&self, key: &ModelKey) -> bool {
        self.declarations
            .get(key)
            .is_some_and(|declaration| !declaration.is_abstract())
    }
}

/// Installed declarations, shared models and tenant descriptors.
///
/// Installation order is irrelevant: references between models are only
/// resolved when a concrete model is synthesized.
#[derive(Debug)]
pub struct ModelCatalog {
    state: RwLock<CatalogState>,
}

impl ModelCatalog {
    /// A catalog with the built-in `tenancy.Tenant` and `contenttypes.ContentType` installed.
    pub fn new() -> Self {
        let catalog = Self::empty();
        {
            let mut state = catalog.write();
            for model in builtin_models() {
                state.shared.insert(model.key().clone(), model);
            }
        }
        catalog
    }

    pub fn empty() -> Self {
        Self {
            state: RwLock::new(CatalogState::default()),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, CatalogState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, CatalogState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs a tenant-aware declaration and, unless abstract, its tenant descriptor.
    pub fn install(&self, declaration: Declaration) -> Result<(), ConfigurationError> {
        let label = declaration.label();
        check_names(
            &label,
            [declaration.key().app_label(), declaration.object_name()]
                .into_iter()
                .chain(declaration.fields().iter().map(|field| field.name.as_str())),
        )?;

        let mut state = self.write();
        let key = declaration.key().clone();
        if state.declarations.contains_key(&key) || state.shared.contains_key(&key) {
            return Err(ConfigurationError::DuplicateDeclaration { model: label });
        }

        if !declaration.is_abstract() {
            let name = declaration.descriptor_name();
            if let Some(existing) = state.descriptors.get(&name) {
                return Err(ConfigurationError::DescriptorConflict {
                    name,
                    existing: existing.to_string(),
                    model: key.to_string(),
                });
            }
            debug!(descriptor = %name, model = %key, "installed tenant descriptor");
            state.descriptors.insert(name, key.clone());
        }

        state.declarations.insert(key, declaration);
        Ok(())
    }

    pub fn install_shared(&self, model: SharedModel) -> Result<(), ConfigurationError> {
        // Fields of mixins end up in tenant tables.
        if model.is_abstract() {
            check_names(&model.label(), model.fields().iter().map(|field| field.name.as_str()))?;
        }

        let mut state = self.write();
        let key = model.key().clone();
        if state.declarations.contains_key(&key) || state.shared.contains_key(&key) {
            return Err(ConfigurationError::DuplicateDeclaration {
                model: model.label(),
            });
        }
        state.shared.insert(key, model);
        Ok(())
    }

    pub fn declaration(&self, key: &ModelKey) -> Option<Declaration> {
        self.read().declaration(key).cloned()
    }

    pub fn is_tenant_model(&self, key: &ModelKey) -> bool {
        self.read().is_tenant_model(key)
    }

    /// Looks a tenant descriptor up by accessor name.
    pub fn descriptor(&self, name: &str) -> Result<TenantDescriptor, ConfigurationError> {
        self.read()
            .descriptors
            .get(name)
            .map(|key| TenantDescriptor::new(name, key.clone()))
            .ok_or_else(|| ConfigurationError::UnknownDescriptor {
                name: name.to_string(),
            })
    }

    pub fn descriptors(&self) -> Vec<TenantDescriptor> {
        self.read()
            .descriptors
            .iter()
            .map(|(name, key)| TenantDescriptor::new(name, key.clone()))
            .collect()
    }

    /// Resolves the tenant-model setting (`app_label.ModelName`).
    pub fn tenant_model(&self, setting: &str) -> Result<SharedModel, ConfigurationError> {
        let key = ModelKey::parse(setting).ok_or_else(|| ConfigurationError::MalformedTenantModel {
            value: setting.to_string(),
        })?;

        let state = self.read();
        if state.declarations.contains_key(&key) {
            return Err(ConfigurationError::NotATenantModel {
                value: setting.to_string(),
            });
        }

        let model = state
            .shared
            .get(&key)
            .ok_or_else(|| ConfigurationError::TenantModelNotInstalled {
                value: setting.to_string(),
            })?;

        if !model.is_tenant_base() {
            return Err(ConfigurationError::NotATenantModel {
                value: setting.to_string(),
            });
        }

        Ok(model.clone())
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::new()
    }
}

fn builtin_models() -> Vec<SharedModel> {
    vec![
        SharedModel::table("tenancy", "Tenant", "tenants", ColumnType::Uuid).tenant_base(),
        SharedModel::table(
            "contenttypes",
            "ContentType",
            "model_metadata",
            ColumnType::BigInteger,
        ),
    ]
}

fn check_names<'n>(
    declaration: &str,
    names: impl IntoIterator<Item = &'n str>,
) -> Result<(), ConfigurationError> {
    match names.into_iter().find(|name| !is_valid_segment(name)) {
        Some(name) => Err(ConfigurationError::InvalidName {
            declaration: declaration.to_string(),
            name: name.to_string(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldDecl;

    #[test]
    fn tenant_model_setting_must_be_dotted() {
        let catalog = ModelCatalog::new();
        let err = catalog.tenant_model("tenancy").unwrap_err();
        assert_eq!(
            err.to_string(),
            "TENANCY_TENANT_MODEL must be of the form 'app_label.model_name'"
        );
    }

    #[test]
    fn tenant_model_setting_must_be_installed() {
        let catalog = ModelCatalog::new();
        let err = catalog.tenant_model("not.Installed").unwrap_err();
        assert_eq!(
            err.to_string(),
            "TENANCY_TENANT_MODEL refers to model 'not.Installed' that has not been installed"
        );
    }

    #[test]
    fn tenant_model_setting_must_be_a_tenant() {
        let catalog = ModelCatalog::new();
        let err = catalog.tenant_model("contenttypes.ContentType").unwrap_err();
        assert_eq!(
            err.to_string(),
            "TENANCY_TENANT_MODEL refers to models 'contenttypes.ContentType' which is not a subclass of 'tenancy.AbstractTenant'"
        );

        let tenant = catalog.tenant_model("tenancy.Tenant").unwrap();
        assert_eq!(tenant.table_name(), Some("tenants"));
    }

    #[test]
    fn install_registers_descriptor_except_for_abstract() {
        let catalog = ModelCatalog::new();
        catalog
            .install(Declaration::abstract_model("tests", "AbstractTenantModel"))
            .unwrap();
        catalog
            .install(Declaration::new("tests", "SpecificModel").parent("AbstractTenantModel"))
            .unwrap();

        let names: Vec<String> = catalog
            .descriptors()
            .into_iter()
            .map(|d| d.name().to_string())
            .collect();
        assert_eq!(names, vec!["specificmodels".to_string()]);
        assert!(catalog.descriptor("abstracttenantmodels").is_err());
    }

    #[test]
    fn duplicate_descriptor_names_conflict() {
        let catalog = ModelCatalog::new();
        catalog
            .install(Declaration::new("tests", "Widget"))
            .unwrap();
        let err = catalog
            .install(Declaration::new("other", "Gadget").related_name("widgets"))
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::DescriptorConflict { .. }));
    }

    #[test]
    fn names_that_would_blur_table_names_are_rejected() {
        let catalog = ModelCatalog::new();
        let err = catalog
            .install(Declaration::new("shop__old", "Item"))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::InvalidName {
                declaration: "shop__old.Item".to_string(),
                name: "shop__old".to_string(),
            }
        );

        let err = catalog
            .install(Declaration::new("shop", "Item").field(FieldDecl::text("price_")))
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidName { ref name, .. } if name == "price_"));

        catalog
            .install(Declaration::new("shop", "Item").field(FieldDecl::text("unit_price")))
            .unwrap();
    }

    #[test]
    fn resolve_handles_self_bare_and_dotted_references() {
        let catalog = ModelCatalog::new();
        catalog
            .install(Declaration::new("tests", "Category").field(FieldDecl::text("name")))
            .unwrap();
        let owner = ModelKey::new("tests", "Widget");
        let state = catalog.read();

        assert!(matches!(
            state.resolve("Category", &owner),
            Some(Resolved::Tenant(_))
        ));
        assert!(matches!(
            state.resolve("tenancy.Tenant", &owner),
            Some(Resolved::Shared(_))
        ));
        assert_eq!(
            state.resolve("self", &owner).map(|r| r.key().clone()),
            None,
            "owner is not installed yet"
        );
        assert!(state.resolve("missing.Model", &owner).is_none());
    }
}
