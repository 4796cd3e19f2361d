/*!
# Saving chains and sample sets to CSV

Enable via the `csv` feature. Columns are named after the parameters when
names are given and `dim_0`, `dim_1`, ... otherwise.
*/

use std::fs::File;
use std::path::Path;

use csv::Writer;

use crate::ensemble::SampleSet;
use crate::error::{CalibrationError, Result};
use crate::sampler::Chain;

fn column_names(names: &[String], n_params: usize) -> Result<Vec<String>> {
    if names.is_empty() {
        return Ok((0..n_params).map(|i| format!("dim_{}", i)).collect());
    }
    if names.len() != n_params {
        return Err(CalibrationError::ShapeMismatch(format!(
            "{} column names for {} parameters",
            names.len(),
            n_params
        )));
    }
    Ok(names.to_vec())
}

/**
Saves full chains, one row per iteration.

The header is `chain`, `iteration`, one column per parameter, then
`log_density` and `proposal_sd`.

# Examples

```rust
use sir_calibrate::distributions::Target;
use sir_calibrate::io::csv::save_chains;
use sir_calibrate::sampler::AdaptiveMetropolis;

struct Flat;
impl Target for Flat {
    fn unnorm_log_prob(&self, _theta: &[f64]) -> f64 {
        0.0
    }
}

let chain = AdaptiveMetropolis::new(Flat).set_seed(1).run(&[0.5], 10, 0.1, 0.234, 0.01)?;
let dir = std::env::temp_dir().join("sir_calibrate_doc_chains.csv");
save_chains(&[chain], &["beta".to_string()], &dir)?;
# Ok::<(), Box<dyn std::error::Error>>(())
```
*/
pub fn save_chains<P: AsRef<Path>>(chains: &[Chain], names: &[String], path: P) -> Result<()> {
    let n_params = chains.first().map(Chain::n_params).unwrap_or(names.len());
    let columns = column_names(names, n_params)?;

    let mut wtr = Writer::from_writer(File::create(path)?);
    let mut header = vec!["chain".to_string(), "iteration".to_string()];
    header.extend(columns);
    header.push("log_density".to_string());
    header.push("proposal_sd".to_string());
    wtr.write_record(&header)?;

    for (chain_idx, chain) in chains.iter().enumerate() {
        if chain.n_params() != n_params {
            return Err(CalibrationError::ShapeMismatch(format!(
                "chain {} has {} parameters, expected {}",
                chain_idx,
                chain.n_params(),
                n_params
            )));
        }
        let rows = chain
            .samples()
            .rows()
            .into_iter()
            .zip(chain.log_densities())
            .zip(chain.proposal_sd_trace());
        for (iteration, ((sample, lp), sd)) in rows.enumerate() {
            let mut row = vec![chain_idx.to_string(), iteration.to_string()];
            row.extend(sample.iter().map(|v| v.to_string()));
            row.push(lp.to_string());
            row.push(sd.to_string());
            wtr.write_record(&row)?;
        }
    }

    wtr.flush()?;
    Ok(())
}

/// Saves post-burn-in samples with header `chain`, `sample`, then one column
/// per parameter. Sample indices restart at 0 after burn-in.
pub fn save_sample_set<P: AsRef<Path>>(samples: &SampleSet, names: &[String], path: P) -> Result<()> {
    let columns = column_names(names, samples.n_params())?;

    let mut wtr = Writer::from_writer(File::create(path)?);
    let mut header = vec!["chain".to_string(), "sample".to_string()];
    header.extend(columns);
    wtr.write_record(&header)?;

    for (chain_idx, chain) in samples.per_chain().iter().enumerate() {
        for (sample_idx, sample) in chain.rows().into_iter().enumerate() {
            let mut row = vec![chain_idx.to_string(), sample_idx.to_string()];
            row.extend(sample.iter().map(|v| v.to_string()));
            wtr.write_record(&row)?;
        }
    }

    wtr.flush()?;
    Ok(())
}
