use serde::{Deserialize, Deserializer, Serialize};

use companies_core::{
    Company, CompanyDraft, CompanyName, CompanyPatch, CompanyType, DomainError, Page,
};

// -------------------------
// Request DTOs
// -------------------------

/// Body of `POST /companies` and `PUT /companies/:id`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompanyRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub employees: u32,
    pub registered: bool,
    #[serde(rename = "type")]
    pub kind: CompanyType,
}

impl CompanyRequest {
    pub fn into_draft(self) -> Result<CompanyDraft, DomainError> {
        let draft = CompanyDraft {
            name: CompanyName::parse(self.name)?,
            description: self.description,
            employees: self.employees,
            registered: self.registered,
            kind: self.kind,
        };
        draft.validate()?;
        Ok(draft)
    }
}

/// Body of `PATCH /companies/:id`. Absent fields are left unchanged;
/// `"description": null` clears the description.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatchCompanyRequest {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub description: Option<Option<String>>,
    pub employees: Option<u32>,
    pub registered: Option<bool>,
    #[serde(rename = "type")]
    pub kind: Option<CompanyType>,
}

impl PatchCompanyRequest {
    pub fn into_patch(self) -> Result<CompanyPatch, DomainError> {
        Ok(CompanyPatch {
            name: self.name.map(CompanyName::parse).transpose()?,
            description: self.description,
            employees: self.employees,
            registered: self.registered,
            kind: self.kind,
        })
    }
}

/// Distinguishes a missing field (`None`) from an explicit `null` (`Some(None)`).
fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub limit: Option<u32>,
    pub offset: Option<u64>,
}

impl ListQuery {
    pub fn page(&self) -> Page {
        Page::new(self.limit, self.offset)
    }
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct CompanyList {
    pub items: Vec<Company>,
    pub limit: u32,
    pub offset: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn patch_distinguishes_null_from_absent() {
        let absent: PatchCompanyRequest = serde_json::from_value(json!({ "employees": 4 })).unwrap();
        assert_eq!(absent.description, None);

        let cleared: PatchCompanyRequest =
            serde_json::from_value(json!({ "description": null })).unwrap();
        assert_eq!(cleared.description, Some(None));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let res = serde_json::from_value::<PatchCompanyRequest>(json!({ "employes": 4 }));
        assert!(res.is_err());
    }

    #[test]
    fn create_request_validates_name() {
        let req: CompanyRequest = serde_json::from_value(json!({
            "name": "a name that is far too long",
            "employees": 1,
            "registered": true,
            "type": "corporations",
        }))
        .unwrap();
        assert!(matches!(req.into_draft(), Err(DomainError::Validation(_))));
    }
}
