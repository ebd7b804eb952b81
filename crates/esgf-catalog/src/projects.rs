//! Supported projects and their facet definitions.
//!
//! Each archive project names its facets differently (CMIP6 `source_id` vs
//! CMIP5 `model`). The [`Project`] enum centralizes those vocabularies so the
//! rest of the crate can ask for roles (variable, model, variant, grid)
//! without knowing project specifics. A role may be absent: the older CMIP
//! archives have no grid facet, and the observational archives have no
//! variant facet.

use crate::error::{EsgfError, Result};
use std::collections::HashMap;

/// A supported archive project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Project {
    Cmip6,
    Cmip5,
    Cmip3,
    Obs4Mips,
    Input4Mips,
}

/// Every registered project.
pub const ALL: [Project; 5] = [
    Project::Cmip6,
    Project::Cmip5,
    Project::Cmip3,
    Project::Obs4Mips,
    Project::Input4Mips,
];

impl Project {
    /// The canonical project tag as used in search facets.
    pub fn as_str(&self) -> &'static str {
        match self {
            Project::Cmip6 => "CMIP6",
            Project::Cmip5 => "CMIP5",
            Project::Cmip3 => "CMIP3",
            Project::Obs4Mips => "obs4MIPs",
            Project::Input4Mips => "input4MIPs",
        }
    }

    /// Facets defining the master id, excluding version and data node.
    pub fn master_id_facets(&self) -> &'static [&'static str] {
        match self {
            Project::Cmip6 => &[
                "mip_era",
                "activity_drs",
                "institution_id",
                "source_id",
                "experiment_id",
                "member_id",
                "table_id",
                "variable_id",
                "grid_label",
            ],
            Project::Cmip5 => &[
                "institute",
                "model",
                "experiment",
                "time_frequency",
                "realm",
                "cmor_table",
                "ensemble",
                "variable",
            ],
            Project::Cmip3 => &[
                "project",
                "institute",
                "model",
                "experiment",
                "time_frequency",
                "realm",
                "ensemble",
                "variable",
            ],
            Project::Obs4Mips => &[
                "activity_id",
                "institution_id",
                "source_id",
                "frequency",
                "variable_id",
                "grid_label",
            ],
            Project::Input4Mips => &[
                "activity_id",
                "mip_era",
                "target_mip",
                "institution_id",
                "source_id",
                "realm",
                "frequency",
                "variable_id",
                "grid_label",
            ],
        }
    }

    /// Facets defining the full dataset id, `{master}.v{version}|{data_node}`.
    pub fn id_facets(&self) -> Vec<&'static str> {
        let mut facets = self.master_id_facets().to_vec();
        facets.push("version");
        facets.push("data_node");
        facets
    }

    /// Facets to drop, in order, when widening an auxiliary-variable search.
    pub fn relaxation_facets(&self) -> &'static [&'static str] {
        match self {
            Project::Cmip6 => &[
                "member_id",
                "experiment_id",
                "activity_drs",
                "institution_id",
            ],
            Project::Cmip5 | Project::Cmip3 => &["ensemble", "experiment", "institute"],
            Project::Obs4Mips | Project::Input4Mips => &["institution_id"],
        }
    }

    /// Facets that describe the specific variable.
    pub fn variable_description_facets(&self) -> &'static [&'static str] {
        match self {
            Project::Cmip6 => &["table_id", "variable_id"],
            Project::Cmip5 => &["time_frequency", "realm", "cmor_table", "variable"],
            Project::Cmip3 => &["time_frequency", "realm", "variable"],
            Project::Obs4Mips => &["frequency", "variable_id"],
            Project::Input4Mips => &["realm", "frequency", "variable_id"],
        }
    }

    pub fn variable_facet(&self) -> &'static str {
        match self {
            Project::Cmip6 | Project::Obs4Mips | Project::Input4Mips => "variable_id",
            Project::Cmip5 | Project::Cmip3 => "variable",
        }
    }

    pub fn model_facet(&self) -> &'static str {
        match self {
            Project::Cmip6 | Project::Obs4Mips | Project::Input4Mips => "source_id",
            Project::Cmip5 | Project::Cmip3 => "model",
        }
    }

    /// The variant (ensemble member) facet, absent for observational archives.
    pub fn variant_facet(&self) -> Option<&'static str> {
        match self {
            Project::Cmip6 => Some("member_id"),
            Project::Cmip5 | Project::Cmip3 => Some("ensemble"),
            Project::Obs4Mips | Project::Input4Mips => None,
        }
    }

    /// The grid facet, absent for the older CMIP archives.
    pub fn grid_facet(&self) -> Option<&'static str> {
        match self {
            Project::Cmip6 | Project::Obs4Mips | Project::Input4Mips => Some("grid_label"),
            Project::Cmip5 | Project::Cmip3 => None,
        }
    }

    /// Facets whose distinct value tuples define a model group.
    pub fn modelgroup_facets(&self) -> Vec<&'static str> {
        [
            Some(self.model_facet()),
            self.variant_facet(),
            self.grid_facet(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// Render the master id from a facet map.
    pub fn master_id(&self, facets: &HashMap<String, String>) -> Result<String> {
        let mut parts = Vec::with_capacity(self.master_id_facets().len());
        for facet in self.master_id_facets() {
            let value = facets.get(*facet).ok_or_else(|| EsgfError::Other(
                format!("facet map is missing required facet '{facet}'"),
            ))?;
            parts.push(value.as_str());
        }
        Ok(parts.join("."))
    }
}

impl std::fmt::Display for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Look up a project by its (case-insensitive) tag.
pub fn get(project_id: &str) -> Result<Project> {
    let wanted = project_id.to_lowercase();
    ALL.iter()
        .copied()
        .find(|p| p.as_str().to_lowercase() == wanted)
        .ok_or_else(|| EsgfError::UnknownProject(project_id.to_string()))
}

/// Return the project whose master-id facets most overlap the given names.
///
/// The `project` attribute is not always part of a dataset's global
/// attributes, so when resolving facets of unknown origin we pick the project
/// with the best overlap.
pub fn likely_project<'a>(facets: impl IntoIterator<Item = &'a str>) -> Project {
    let names: Vec<&str> = facets.into_iter().collect();
    ALL.iter()
        .copied()
        .max_by_key(|p| {
            p.master_id_facets()
                .iter()
                .filter(|f| names.contains(*f))
                .count()
        })
        .unwrap_or(Project::Cmip6)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup_case_insensitive() {
        assert_eq!(get("cmip6").unwrap(), Project::Cmip6);
        assert_eq!(get("CMIP5").unwrap(), Project::Cmip5);
        assert_eq!(get("OBS4MIPS").unwrap(), Project::Obs4Mips);
        assert!(matches!(get("cmip9"), Err(EsgfError::UnknownProject(_))));
    }

    #[test]
    fn test_id_facets_extend_master() {
        for project in ALL {
            let ids = project.id_facets();
            assert_eq!(&ids[..ids.len() - 2], project.master_id_facets());
            assert_eq!(ids[ids.len() - 2], "version");
            assert_eq!(ids[ids.len() - 1], "data_node");
        }
    }

    #[test]
    fn test_modelgroup_filters_absent_roles() {
        assert_eq!(
            Project::Cmip6.modelgroup_facets(),
            vec!["source_id", "member_id", "grid_label"]
        );
        // no grid facet in CMIP5
        assert_eq!(Project::Cmip5.modelgroup_facets(), vec!["model", "ensemble"]);
        // no variant facet in obs4MIPs
        assert_eq!(
            Project::Obs4Mips.modelgroup_facets(),
            vec!["source_id", "grid_label"]
        );
    }

    #[test]
    fn test_likely_project_by_overlap() {
        assert_eq!(
            likely_project(["source_id", "member_id", "table_id", "grid_label"]),
            Project::Cmip6
        );
        assert_eq!(
            likely_project(["model", "cmor_table", "ensemble", "time_frequency"]),
            Project::Cmip5
        );
    }

    #[test]
    fn test_master_id_rendering() {
        let facets: HashMap<String, String> = [
            ("mip_era", "CMIP6"),
            ("activity_drs", "CMIP"),
            ("institution_id", "CCCma"),
            ("source_id", "CanESM5"),
            ("experiment_id", "historical"),
            ("member_id", "r1i1p1f1"),
            ("table_id", "Amon"),
            ("variable_id", "tas"),
            ("grid_label", "gn"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        assert_eq!(
            Project::Cmip6.master_id(&facets).unwrap(),
            "CMIP6.CMIP.CCCma.CanESM5.historical.r1i1p1f1.Amon.tas.gn"
        );
    }
}
