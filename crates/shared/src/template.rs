use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub id: String,
    pub title: String,
}

/// Fixed column layout and vote budget a session inherits at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetroTemplate {
    pub id: String,
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub max_votes_per_person: u32,
}

impl RetroTemplate {
    pub fn has_column(&self, column_id: &str) -> bool {
        self.columns.iter().any(|column| column.id == column_id)
    }
}

pub const DEFAULT_TEMPLATE_ID: &str = "went_well_to_improve";

fn template(id: &str, name: &str, columns: &[(&str, &str)], max_votes_per_person: u32) -> RetroTemplate {
    RetroTemplate {
        id: id.to_string(),
        name: name.to_string(),
        columns: columns
            .iter()
            .map(|(id, title)| ColumnDef {
                id: (*id).to_string(),
                title: (*title).to_string(),
            })
            .collect(),
        max_votes_per_person,
    }
}

pub fn builtin_templates() -> Vec<RetroTemplate> {
    vec![
        template(
            DEFAULT_TEMPLATE_ID,
            "Went well / To improve",
            &[
                ("went_well", "What went well"),
                ("to_improve", "What could be improved"),
                ("action_items", "Action items"),
            ],
            5,
        ),
        template(
            "start_stop_continue",
            "Start / Stop / Continue",
            &[
                ("start", "Start"),
                ("stop", "Stop"),
                ("continue", "Continue"),
            ],
            3,
        ),
        template(
            "mad_sad_glad",
            "Mad / Sad / Glad",
            &[("mad", "Mad"), ("sad", "Sad"), ("glad", "Glad")],
            3,
        ),
        template(
            "four_ls",
            "4Ls",
            &[
                ("liked", "Liked"),
                ("learned", "Learned"),
                ("lacked", "Lacked"),
                ("longed_for", "Longed for"),
            ],
            4,
        ),
    ]
}

pub fn find_template(template_id: &str) -> Option<RetroTemplate> {
    builtin_templates()
        .into_iter()
        .find(|template| template.id == template_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_template_is_registered() {
        let template = find_template(DEFAULT_TEMPLATE_ID).expect("default template");
        assert!(template.has_column("went_well"));
        assert_eq!(template.max_votes_per_person, 5);
    }

    #[test]
    fn template_ids_are_unique() {
        let templates = builtin_templates();
        let mut ids: Vec<_> = templates.iter().map(|t| t.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), templates.len());
    }
}
