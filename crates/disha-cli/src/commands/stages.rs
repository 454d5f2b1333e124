//! Stages command - list the pipeline stages in dependency order.

use disha_engines::StageId;

/// Prints every stage with its upstream dependencies.
pub fn execute() {
    println!("{:<22} depends on", "stage");
    for stage in StageId::ALL {
        let deps: Vec<&str> = stage.depends_on().iter().map(|d| d.as_str()).collect();
        let deps = if deps.is_empty() {
            "-".to_string()
        } else {
            deps.join(", ")
        };
        println!("{:<22} {deps}", stage.as_str());
    }
}
