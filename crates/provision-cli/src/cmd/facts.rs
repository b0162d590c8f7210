use crate::output::print_json;
use provision_core::facts::Facts;

pub fn run(json: bool) -> anyhow::Result<()> {
    let facts = Facts::gather();
    if json {
        return print_json(&facts);
    }
    let yes_no = |b: bool| if b { "yes" } else { "no" };
    match &facts.gpu_name {
        Some(name) => println!("gpu:     yes ({name})"),
        None => println!("gpu:     {}", yes_no(facts.gpu)),
    }
    println!("memory:  {} MiB", facts.memory_mb);
    println!("docker:  {}", yes_no(facts.docker));
    println!("systemd: {}", yes_no(facts.systemd));
    Ok(())
}
